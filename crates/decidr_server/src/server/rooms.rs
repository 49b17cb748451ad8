#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use decidr_domain::{GroupId, SessionId, UserId};
use decidr_protocol::ServerEvent;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use crate::server::presence::PresenceCache;

/// Outbound handle to one live session: the bounded send queue plus the kill
/// signal used for drop-with-disconnect on overflow.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	pub session_id: SessionId,
	pub user_id: UserId,
	tx: mpsc::Sender<ServerEvent>,
	kill: Arc<Notify>,
}

impl SessionHandle {
	pub fn new(session_id: SessionId, user_id: UserId, tx: mpsc::Sender<ServerEvent>, kill: Arc<Notify>) -> Self {
		Self {
			session_id,
			user_id,
			tx,
			kill,
		}
	}

	/// Queue an event without blocking. A full queue schedules the session
	/// for disconnect; a slow consumer must never stall a publisher.
	pub fn send(&self, event: ServerEvent) -> bool {
		match self.tx.try_send(event) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("decidr_server_send_queue_overflows_total").increment(1);
				warn!(session = %self.session_id, "send queue full; disconnecting session");
				// notify_one stores a permit, so the kill is not lost when the
				// read loop is mid-handler rather than parked on notified().
				self.kill.notify_one();
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Result of a join: the live session count after the add.
#[derive(Debug, Clone, Copy)]
pub struct JoinOutcome {
	pub member_count: usize,
	pub first_join: bool,
}

/// Result of a leave: the live session count after the removal.
#[derive(Debug, Clone, Copy)]
pub struct LeaveOutcome {
	pub member_count: usize,
	pub was_joined: bool,
	pub last_leave: bool,
}

/// In-process registry of live sessions per group, owner of fan-out and the
/// edge-triggered presence notifications.
///
/// One mutex guards the registry. Presence SADD/SREM for the per-(user,group)
/// socket set run while it is held, which makes the first-join/last-leave
/// decision race-free; broadcasts issued under the lock give each room a
/// total delivery order.
#[derive(Clone)]
pub struct RoomManager {
	inner: Arc<Mutex<Inner>>,
	presence: PresenceCache,
}

#[derive(Default)]
struct Inner {
	rooms: HashMap<GroupId, RoomEntry>,
}

#[derive(Default)]
struct RoomEntry {
	sessions: HashMap<SessionId, SessionHandle>,
}

impl RoomEntry {
	fn prune_closed(&mut self) {
		self.sessions.retain(|_, handle| !handle.is_closed());
	}

	fn emit(&mut self, event: &ServerEvent, exclude: Option<&SessionId>) {
		let mut failed = Vec::new();
		for (session_id, handle) in self.sessions.iter() {
			if exclude == Some(session_id) {
				continue;
			}
			if !handle.send(event.clone()) {
				failed.push(*session_id);
			}
		}
		for session_id in failed {
			self.sessions.remove(&session_id);
		}
	}
}

impl RoomManager {
	pub fn new(presence: PresenceCache) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			presence,
		}
	}

	/// Join protocol steps 2-4: registry add, presence update, first-join
	/// broadcast. Membership authorization is the caller's step 1.
	pub async fn join(&self, group: &GroupId, handle: SessionHandle, user_name: &str) -> JoinOutcome {
		let session_id = handle.session_id;
		let user_id = handle.user_id.clone();

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(group.clone()).or_default();
		entry.prune_closed();
		entry.sessions.insert(session_id, handle);

		let edge = self.presence.add_room_session(&user_id, group, &session_id).await;
		let member_count = entry.sessions.len();

		if edge.first_join {
			debug!(group = %group, user = %user_id, "first join");
			entry.emit(
				&ServerEvent::UserJoinedGroup {
					user_id: user_id.to_string(),
					user_name: user_name.to_string(),
					group_id: group.to_string(),
					member_count,
				},
				Some(&session_id),
			);
		}

		JoinOutcome {
			member_count,
			first_join: edge.first_join,
		}
	}

	/// Leave protocol, also run per room by the disconnect sweep. Idempotent:
	/// a session that already left produces no broadcast.
	pub async fn leave(&self, group: &GroupId, session_id: &SessionId, user_id: &UserId, user_name: &str) -> LeaveOutcome {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(group) else {
			// Still reconcile the cache: a crash may have left stale keys.
			let edge = self.presence.remove_room_session(user_id, group, session_id).await;
			return LeaveOutcome {
				member_count: 0,
				was_joined: false,
				last_leave: edge.last_leave,
			};
		};

		let was_joined = entry.sessions.remove(session_id).is_some();
		let edge = self.presence.remove_room_session(user_id, group, session_id).await;
		let member_count = entry.sessions.len();

		if edge.last_leave {
			debug!(group = %group, user = %user_id, "last leave");
			entry.emit(
				&ServerEvent::UserLeftGroup {
					user_id: user_id.to_string(),
					user_name: user_name.to_string(),
					group_id: group.to_string(),
					member_count,
				},
				Some(session_id),
			);
		}

		if entry.sessions.is_empty() {
			inner.rooms.remove(group);
		}

		LeaveOutcome {
			member_count,
			was_joined,
			last_leave: edge.last_leave,
		}
	}

	/// Fan a single event out to every live session of a room. A send failure
	/// on one session never aborts delivery to the others.
	pub async fn broadcast(&self, group: &GroupId, event: ServerEvent, exclude: Option<&SessionId>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(group) else {
			return;
		};

		entry.prune_closed();
		entry.emit(&event, exclude);

		if entry.sessions.is_empty() {
			inner.rooms.remove(group);
		}
	}

	/// Whether the session has joined the room. Membership alone is not
	/// enough to send; this is the stricter check.
	pub async fn is_joined(&self, group: &GroupId, session_id: &SessionId) -> bool {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(group)
			.is_some_and(|entry| entry.sessions.contains_key(session_id))
	}

	/// Groups this session is currently joined to, from the registry. The
	/// disconnect sweep unions this with `user:{u}:rooms` so cleanup survives
	/// a degraded cache.
	pub async fn groups_of_session(&self, session_id: &SessionId) -> Vec<GroupId> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.filter(|(_, entry)| entry.sessions.contains_key(session_id))
			.map(|(group, _)| group.clone())
			.collect()
	}

	/// Distinct users with a live session in the room. Presence cache first;
	/// when it reads empty but the registry disagrees, the registry wins.
	pub async fn online_users(&self, group: &GroupId) -> Vec<UserId> {
		let mut users = self.presence.users_in_room(group).await;
		if users.is_empty() {
			let inner = self.inner.lock().await;
			if let Some(entry) = inner.rooms.get(group) {
				let mut distinct: Vec<UserId> = Vec::new();
				for handle in entry.sessions.values() {
					if !distinct.contains(&handle.user_id) {
						distinct.push(handle.user_id.clone());
					}
				}
				users = distinct;
			}
		}
		users.sort();
		users
	}
}
