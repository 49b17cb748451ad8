#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use decidr_domain::{GroupId, SessionId, UserId};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

/// Contract TTLs for the ephemeral keys.
#[derive(Debug, Clone)]
pub struct PresenceTtls {
	/// `user:{u}:sockets` and `user:{u}:sockets:{g}` (sliding).
	pub sockets: Duration,
	/// `room:{g}:users` and `user:{u}:rooms` (sliding).
	pub rooms: Duration,
	/// `typing:{g}:{u}` (absolute).
	pub typing: Duration,
}

impl Default for PresenceTtls {
	fn default() -> Self {
		Self {
			sockets: Duration::from_secs(60 * 60),
			rooms: Duration::from_secs(24 * 60 * 60),
			typing: Duration::from_secs(10),
		}
	}
}

/// Result of a set add: whether the member was new and how many members the
/// set held immediately before.
#[derive(Debug, Clone, Copy)]
pub struct SetAdd {
	pub added: bool,
	pub prev_len: usize,
}

/// Raw key/value+set operations behind the presence cache.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
	async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> anyhow::Result<SetAdd>;

	/// Remove a member; returns the remaining cardinality.
	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<usize>;

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;

	async fn scard(&self, key: &str) -> anyhow::Result<usize>;

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

	async fn exists(&self, key: &str) -> anyhow::Result<bool>;

	async fn del(&self, key: &str) -> anyhow::Result<()>;

	/// Glob scan. Only used for the `typing:*:{user}` disconnect sweep.
	async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;

	async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
}

fn key_user_sockets(user: &UserId) -> String {
	format!("user:{user}:sockets")
}

fn key_room_users(group: &GroupId) -> String {
	format!("room:{group}:users")
}

fn key_user_rooms(user: &UserId) -> String {
	format!("user:{user}:rooms")
}

fn key_user_room_sockets(user: &UserId, group: &GroupId) -> String {
	format!("user:{user}:sockets:{group}")
}

fn key_typing(group: &GroupId, user: &UserId) -> String {
	format!("typing:{group}:{user}")
}

/// Edge information from a room join.
#[derive(Debug, Clone, Copy)]
pub struct JoinEdge {
	/// True iff the user had no live session in this room immediately before.
	pub first_join: bool,
}

/// Edge information from a room leave.
#[derive(Debug, Clone, Copy)]
pub struct LeaveEdge {
	/// True iff the user's last live session in this room just left.
	pub last_leave: bool,
}

/// Typed presence operations over the sockets/rooms/typing key shapes.
///
/// Every operation degrades gracefully: a failing backend turns reads into
/// empty results and writes into no-ops, with a warn log and a counter. The
/// room registry stays authoritative for fan-out in that state.
#[derive(Clone)]
pub struct PresenceCache {
	backend: Arc<dyn PresenceBackend>,
	ttls: PresenceTtls,
}

impl PresenceCache {
	pub fn new(backend: Arc<dyn PresenceBackend>, ttls: PresenceTtls) -> Self {
		Self { backend, ttls }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryPresence::new()), PresenceTtls::default())
	}

	fn degrade<T: Default>(op: &'static str, result: anyhow::Result<T>) -> T {
		match result {
			Ok(v) => v,
			Err(e) => {
				metrics::counter!("decidr_server_presence_errors_total", "op" => op).increment(1);
				warn!(op, error = %e, "presence backend unavailable; degrading");
				T::default()
			}
		}
	}

	pub async fn track_socket(&self, user: &UserId, session: &SessionId) {
		let key = key_user_sockets(user);
		Self::degrade(
			"track_socket",
			self.backend
				.sadd(&key, &session.to_string(), self.ttls.sockets)
				.await
				.map(|_| ()),
		);
	}

	pub async fn untrack_socket(&self, user: &UserId, session: &SessionId) {
		let key = key_user_sockets(user);
		Self::degrade(
			"untrack_socket",
			self.backend.srem(&key, &session.to_string()).await.map(|_| ()),
		);
	}

	/// Count of live sockets across all of a user's sessions.
	pub async fn socket_count(&self, user: &UserId) -> usize {
		Self::degrade("socket_count", self.backend.scard(&key_user_sockets(user)).await)
	}

	/// Record a session joining a room and report the first-join edge.
	///
	/// The caller must serialize calls per (user, group) — the room manager
	/// holds its registry lock across this — so reading the prior cardinality
	/// from the SADD is race-free.
	pub async fn add_room_session(&self, user: &UserId, group: &GroupId, session: &SessionId) -> JoinEdge {
		let per_room = key_user_room_sockets(user, group);
		let added = Self::degrade(
			"add_room_session",
			self.backend
				.sadd(&per_room, &session.to_string(), self.ttls.sockets)
				.await
				.map(Some),
		);

		let Some(added) = added else {
			return JoinEdge { first_join: false };
		};
		let first_join = added.added && added.prev_len == 0;

		if first_join {
			Self::degrade(
				"add_room_user",
				self.backend
					.sadd(&key_room_users(group), user.as_str(), self.ttls.rooms)
					.await
					.map(|_| ()),
			);
			Self::degrade(
				"add_user_room",
				self.backend
					.sadd(&key_user_rooms(user), group.as_str(), self.ttls.rooms)
					.await
					.map(|_| ()),
			);
		} else {
			// Sliding TTLs: refresh on every join.
			Self::degrade(
				"refresh_room_users",
				self.backend.expire(&key_room_users(group), self.ttls.rooms).await,
			);
			Self::degrade(
				"refresh_user_rooms",
				self.backend.expire(&key_user_rooms(user), self.ttls.rooms).await,
			);
		}

		JoinEdge { first_join }
	}

	/// Record a session leaving a room and report the last-leave edge.
	/// Same serialization requirement as [`PresenceCache::add_room_session`].
	pub async fn remove_room_session(&self, user: &UserId, group: &GroupId, session: &SessionId) -> LeaveEdge {
		let per_room = key_user_room_sockets(user, group);

		// Distinguish "set just became empty" from "was already empty" so a
		// repeated sweep cannot re-announce the leave.
		let existed = Self::degrade("room_session_exists", self.backend.exists(&per_room).await);
		let remaining = Self::degrade("remove_room_session", self.backend.srem(&per_room, &session.to_string()).await);

		let last_leave = existed && remaining == 0;
		if last_leave {
			Self::degrade(
				"remove_room_user",
				self.backend.srem(&key_room_users(group), user.as_str()).await.map(|_| ()),
			);
			Self::degrade(
				"remove_user_room",
				self.backend.srem(&key_user_rooms(user), group.as_str()).await.map(|_| ()),
			);
			Self::degrade("del_room_sessions", self.backend.del(&per_room).await);
		}

		LeaveEdge { last_leave }
	}

	pub async fn users_in_room(&self, group: &GroupId) -> Vec<UserId> {
		let members = Self::degrade("users_in_room", self.backend.smembers(&key_room_users(group)).await);
		members.into_iter().filter_map(|m| UserId::new(m).ok()).collect()
	}

	pub async fn rooms_of_user(&self, user: &UserId) -> Vec<GroupId> {
		let rooms = Self::degrade("rooms_of_user", self.backend.smembers(&key_user_rooms(user)).await);
		rooms.into_iter().filter_map(|g| GroupId::new(g).ok()).collect()
	}

	pub async fn mark_typing(&self, group: &GroupId, user: &UserId) {
		Self::degrade(
			"mark_typing",
			self.backend
				.set_ex(&key_typing(group, user), "1", self.ttls.typing)
				.await,
		);
	}

	pub async fn clear_typing(&self, group: &GroupId, user: &UserId) {
		Self::degrade("clear_typing", self.backend.del(&key_typing(group, user)).await);
	}

	pub async fn is_typing(&self, group: &GroupId, user: &UserId) -> bool {
		Self::degrade("is_typing", self.backend.exists(&key_typing(group, user)).await)
	}

	/// Groups where this user still has a live typing key. Backs the
	/// disconnect sweep of `typing:*:{user}`.
	pub async fn typing_groups_of_user(&self, user: &UserId) -> Vec<GroupId> {
		let pattern = format!("typing:*:{user}");
		let keys = Self::degrade("typing_groups_of_user", self.backend.keys(&pattern).await);
		let suffix = format!(":{user}");
		keys.into_iter()
			.filter_map(|key| {
				let middle = key.strip_prefix("typing:")?.strip_suffix(suffix.as_str())?;
				GroupId::new(middle).ok()
			})
			.collect()
	}
}

/// In-memory presence backend. TTLs are enforced lazily on access.
pub struct MemoryPresence {
	inner: Mutex<HashMap<String, Entry>>,
}

enum Value {
	Set(HashSet<String>),
	Str(#[allow(dead_code)] String),
}

struct Entry {
	value: Value,
	expires_at: Instant,
}

impl Entry {
	fn expired(&self) -> bool {
		Instant::now() >= self.expires_at
	}
}

impl MemoryPresence {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
		}
	}

	fn live_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
		if map.get(key).is_some_and(Entry::expired) {
			map.remove(key);
		}
		map.get_mut(key)
	}
}

impl Default for MemoryPresence {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl PresenceBackend for MemoryPresence {
	async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> anyhow::Result<SetAdd> {
		let mut map = self.inner.lock().await;
		let now = Instant::now();

		match Self::live_entry(&mut map, key) {
			Some(entry) => {
				entry.expires_at = now + ttl;
				match &mut entry.value {
					Value::Set(set) => {
						let prev_len = set.len();
						let added = set.insert(member.to_string());
						Ok(SetAdd { added, prev_len })
					}
					Value::Str(_) => {
						entry.value = Value::Set(HashSet::from([member.to_string()]));
						Ok(SetAdd { added: true, prev_len: 0 })
					}
				}
			}
			None => {
				map.insert(
					key.to_string(),
					Entry {
						value: Value::Set(HashSet::from([member.to_string()])),
						expires_at: now + ttl,
					},
				);
				Ok(SetAdd { added: true, prev_len: 0 })
			}
		}
	}

	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<usize> {
		let mut map = self.inner.lock().await;
		let Some(entry) = Self::live_entry(&mut map, key) else {
			return Ok(0);
		};
		let remaining = match &mut entry.value {
			Value::Set(set) => {
				set.remove(member);
				set.len()
			}
			Value::Str(_) => 0,
		};
		if remaining == 0 {
			map.remove(key);
		}
		Ok(remaining)
	}

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
		let mut map = self.inner.lock().await;
		match Self::live_entry(&mut map, key) {
			Some(Entry {
				value: Value::Set(set), ..
			}) => Ok(set.iter().cloned().collect()),
			_ => Ok(Vec::new()),
		}
	}

	async fn scard(&self, key: &str) -> anyhow::Result<usize> {
		let mut map = self.inner.lock().await;
		match Self::live_entry(&mut map, key) {
			Some(Entry {
				value: Value::Set(set), ..
			}) => Ok(set.len()),
			_ => Ok(0),
		}
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut map = self.inner.lock().await;
		map.insert(
			key.to_string(),
			Entry {
				value: Value::Str(value.to_string()),
				expires_at: Instant::now() + ttl,
			},
		);
		Ok(())
	}

	async fn exists(&self, key: &str) -> anyhow::Result<bool> {
		let mut map = self.inner.lock().await;
		Ok(Self::live_entry(&mut map, key).is_some())
	}

	async fn del(&self, key: &str) -> anyhow::Result<()> {
		let mut map = self.inner.lock().await;
		map.remove(key);
		Ok(())
	}

	async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
		let mut map = self.inner.lock().await;
		map.retain(|_, entry| !entry.expired());
		Ok(map.keys().filter(|k| glob_match(pattern, k)).cloned().collect())
	}

	async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut map = self.inner.lock().await;
		if let Some(entry) = Self::live_entry(&mut map, key) {
			entry.expires_at = Instant::now() + ttl;
		}
		Ok(())
	}
}

/// `*`-only glob match, enough for the `typing:*:{user}` scan.
fn glob_match(pattern: &str, key: &str) -> bool {
	let mut rest = key;
	let mut segments = pattern.split('*').peekable();

	// First segment anchors at the start.
	if let Some(first) = segments.next() {
		let Some(after) = rest.strip_prefix(first) else {
			return false;
		};
		rest = after;
		if segments.peek().is_none() {
			return rest.is_empty();
		}
	}

	while let Some(segment) = segments.next() {
		if segments.peek().is_none() {
			// Last segment anchors at the end.
			return rest.ends_with(segment);
		}
		match rest.find(segment) {
			Some(idx) => rest = &rest[idx + segment.len()..],
			None => return false,
		}
	}

	true
}

/// Redis-backed presence. Edge reads stay race-free because the room manager
/// serializes per-(user,group) mutations above this layer.
pub struct RedisPresence {
	conn: redis::aio::ConnectionManager,
}

impl RedisPresence {
	pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(redis_url)?;
		let conn = client.get_connection_manager().await?;
		Ok(Self { conn })
	}
}

#[async_trait]
impl PresenceBackend for RedisPresence {
	async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> anyhow::Result<SetAdd> {
		let mut conn = self.conn.clone();
		let (prev_len, added): (usize, usize) = redis::pipe()
			.atomic()
			.scard(key)
			.sadd(key, member)
			.expire(key, ttl.as_secs() as i64)
			.ignore()
			.query_async(&mut conn)
			.await?;
		Ok(SetAdd {
			added: added > 0,
			prev_len,
		})
	}

	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<usize> {
		let mut conn = self.conn.clone();
		let (_removed, remaining): (usize, usize) = redis::pipe()
			.atomic()
			.srem(key, member)
			.scard(key)
			.query_async(&mut conn)
			.await?;
		Ok(remaining)
	}

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
		let mut conn = self.conn.clone();
		Ok(conn.smembers(key).await?)
	}

	async fn scard(&self, key: &str) -> anyhow::Result<usize> {
		let mut conn = self.conn.clone();
		Ok(conn.scard(key).await?)
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
		Ok(())
	}

	async fn exists(&self, key: &str) -> anyhow::Result<bool> {
		let mut conn = self.conn.clone();
		Ok(conn.exists(key).await?)
	}

	async fn del(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		conn.del::<_, ()>(key).await?;
		Ok(())
	}

	async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
		let mut conn = self.conn.clone();
		Ok(conn.keys(pattern).await?)
	}

	async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
		Ok(())
	}
}
