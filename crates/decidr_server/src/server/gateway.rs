#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use decidr_domain::{ErrorCode, GroupId, SessionId};
use decidr_protocol::{ClientEvent, DecodeError, InboundFrame, ServerEvent, close, decode_client_event, encode_server_event};
use decidr_store::UserRecord;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::core::ChatCore;
use crate::server::error::ChatError;
use crate::server::rooms::SessionHandle;

/// Identity and outbound handle bound to a session for its lifetime.
pub struct SessionCtx {
	pub session_id: SessionId,
	pub user: UserRecord,
	pub handle: SessionHandle,
}

/// Per-session gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Bounded outbound queue per session; overflow disconnects the session.
	pub session_queue_capacity: usize,

	/// Rate limiting for send_message / typing_start / join_group. Zero
	/// disables the corresponding bucket.
	pub rate_limit_per_conn_burst: u32,
	pub rate_limit_per_conn_per_minute: u32,
	pub rate_limit_per_group_burst: u32,
	pub rate_limit_per_group_per_minute: u32,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			session_queue_capacity: 256,
			rate_limit_per_conn_burst: 0,
			rate_limit_per_conn_per_minute: 0,
			rate_limit_per_group_burst: 0,
			rate_limit_per_group_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Rate-limit gate applied between "event decoded" and "handler runs" for
/// send_message, typing_start, and join_group.
#[derive(Debug)]
pub struct CommandRateLimiter {
	per_connection: Option<TokenBucket>,
	per_group: HashMap<String, TokenBucket>,
	per_group_burst: u32,
	per_group_per_minute: u32,
	max_groups: usize,
}

impl CommandRateLimiter {
	pub fn new(settings: &GatewaySettings) -> Self {
		Self {
			per_connection: TokenBucket::new(settings.rate_limit_per_conn_burst, settings.rate_limit_per_conn_per_minute),
			per_group: HashMap::new(),
			per_group_burst: settings.rate_limit_per_group_burst,
			per_group_per_minute: settings.rate_limit_per_group_per_minute,
			max_groups: 1024,
		}
	}

	pub fn allow(&mut self, event: &ClientEvent) -> bool {
		let group_id = match event {
			ClientEvent::SendMessage(msg) => msg.group_id.as_str(),
			ClientEvent::TypingStart(t) => t.group_id.as_str(),
			ClientEvent::JoinGroup(group) => group.as_str(),
			_ => return true,
		};

		self.allow_connection() && self.allow_group(group_id)
	}

	fn allow_connection(&mut self) -> bool {
		match self.per_connection.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	fn allow_group(&mut self, group_id: &str) -> bool {
		let Some(fresh) = TokenBucket::new(self.per_group_burst, self.per_group_per_minute) else {
			return true;
		};

		if self.per_group.len() >= self.max_groups {
			self.per_group.clear();
		}

		let bucket = self.per_group.entry(group_id.to_string()).or_insert(fresh);
		bucket.allow()
	}
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
	token: Option<String>,
}

/// Router for the socket listener.
pub fn socket_router(core: ChatCore) -> Router {
	Router::new().route("/socket", get(ws_handler)).with_state(core)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers.get(AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Handshake: authenticate exactly once, before the upgrade. A missing or
/// invalid token (or a non-access kind) rejects the connection outright.
async fn ws_handler(
	State(core): State<ChatCore>,
	ws: WebSocketUpgrade,
	headers: HeaderMap,
	Query(query): Query<AuthQuery>,
) -> Response {
	let token = bearer_token(&headers)
		.map(str::to_string)
		.or(query.token)
		.unwrap_or_default();

	let authed = match core.verifier.verify_access(&token) {
		Ok(authed) => authed,
		Err(e) => {
			metrics::counter!("decidr_server_handshake_rejections_total").increment(1);
			warn!(error = %e, "socket handshake rejected");
			return e.into_response();
		}
	};

	debug!(
		user = %authed.user_id,
		email = %authed.email,
		email_verified = authed.email_verified,
		"socket token verified"
	);

	let user = match core.oracle.user_by_id(&authed.user_id).await {
		Ok(Some(user)) => user,
		Ok(None) => {
			warn!(user = %authed.user_id, "token subject has no user row");
			return ChatError::Unauthorized("unknown user".to_string()).into_response();
		}
		Err(e) => return e.into_response(),
	};

	ws.on_upgrade(move |socket| run_session(core, socket, user))
}

async fn run_session(core: ChatCore, socket: WebSocket, user: UserRecord) {
	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("decidr_server_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("decidr_server_active_sessions").increment(1.0);
	metrics::counter!("decidr_server_sessions_total").increment(1);
	let _gauge_guard = SessionGaugeGuard;

	let session_id = SessionId::new_v4();
	info!(session = %session_id, user = %user.id, "session established");

	let kill = Arc::new(Notify::new());
	let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(core.settings.session_queue_capacity);
	let handle = SessionHandle::new(session_id, user.id.clone(), event_tx, Arc::clone(&kill));

	core.presence.track_socket(&user.id, &session_id).await;

	let (ws_tx, mut ws_rx) = socket.split();
	let (close_tx, close_rx) = oneshot::channel::<u16>();
	let mut close_tx = Some(close_tx);
	let writer = tokio::spawn(write_loop(ws_tx, event_rx, close_rx, session_id));

	let mut dispatcher = Dispatcher::new(
		core.clone(),
		SessionCtx {
			session_id,
			user,
			handle,
		},
	);
	let mut limiter = CommandRateLimiter::new(&core.settings);

	// Inbound events for this session are handled serially; the kill signal
	// is only observed between handlers, so an in-flight persist always gets
	// to attempt its broadcast.
	loop {
		tokio::select! {
			_ = kill.notified() => {
				debug!(session = %session_id, "session killed (send queue overflow)");
				break;
			}
			frame = ws_rx.next() => {
				let Some(frame) = frame else { break };
				let message = match frame {
					Ok(message) => message,
					Err(e) => {
						debug!(session = %session_id, error = %e, "transport error");
						break;
					}
				};

				match message {
					Message::Text(text) => match decode_client_event(text.as_str()) {
						Ok(InboundFrame::Event(event)) => {
							metrics::counter!("decidr_server_events_in_total", "event" => event.name()).increment(1);
							if !limiter.allow(&event) {
								metrics::counter!("decidr_server_rate_limited_total").increment(1);
								warn!(session = %session_id, event = event.name(), "rate limited; dropping event");
								continue;
							}
							dispatcher.dispatch(event).await;
						}
						Ok(InboundFrame::Unknown(name)) => {
							metrics::counter!("decidr_server_unknown_events_total").increment(1);
							debug!(session = %session_id, event = %name, "ignoring unknown event");
						}
						Err(DecodeError::Malformed(e)) => {
							warn!(session = %session_id, error = %e, "malformed frame; closing");
							if let Some(tx) = close_tx.take() {
								let _ = tx.send(close::PROTOCOL_ERROR);
							}
							break;
						}
						Err(DecodeError::Payload { event, source }) => {
							debug!(session = %session_id, event = %event, error = %source, "invalid payload");
							dispatcher.ctx.handle.send(ServerEvent::Error {
								message: format!("invalid payload for {event}"),
								code: ErrorCode::ValidationError,
							});
						}
					},
					Message::Close(_) => break,
					// Ping/pong are answered by the transport; binary is not
					// part of the protocol.
					_ => {}
				}
			}
		}
	}

	dispatcher.disconnect_sweep().await;
	drop(dispatcher);
	let _ = writer.await;
	info!(session = %session_id, "session closed");
}

async fn write_loop(
	mut ws_tx: SplitSink<WebSocket, Message>,
	mut event_rx: mpsc::Receiver<ServerEvent>,
	mut close_rx: oneshot::Receiver<u16>,
	session_id: SessionId,
) {
	loop {
		tokio::select! {
			maybe = event_rx.recv() => {
				let Some(event) = maybe else { break };
				let text = match encode_server_event(&event) {
					Ok(text) => text,
					Err(e) => {
						warn!(session = %session_id, error = %e, "failed to encode outbound event");
						continue;
					}
				};
				metrics::counter!("decidr_server_events_out_total", "event" => event.name()).increment(1);
				if ws_tx.send(Message::Text(text.into())).await.is_err() {
					// Peer is gone; the read loop notices on its side.
					break;
				}
			}
			code = &mut close_rx => {
				if let Ok(code) = code {
					let _ = ws_tx
						.send(Message::Close(Some(CloseFrame {
							code,
							reason: Utf8Bytes::from_static("malformed frame"),
						})))
						.await;
				}
				break;
			}
		}
	}
}

/// Per-session event dispatch. Handlers return expected failures as
/// [`ChatError`]; the dispatcher turns those into `error` events and keeps
/// the session open.
pub struct Dispatcher {
	core: ChatCore,
	pub ctx: SessionCtx,
	swept: bool,
}

impl Dispatcher {
	pub fn new(core: ChatCore, ctx: SessionCtx) -> Self {
		Self {
			core,
			ctx,
			swept: false,
		}
	}

	pub async fn dispatch(&self, event: ClientEvent) {
		if let Err(e) = self.handle_event(event).await {
			self.ctx.handle.send(e.to_event());
		}
	}

	async fn handle_event(&self, event: ClientEvent) -> Result<(), ChatError> {
		match event {
			ClientEvent::JoinGroup(group) => self.handle_join(group).await,
			ClientEvent::LeaveGroup(group) => self.handle_leave(group).await,
			ClientEvent::SendMessage(payload) => {
				self.core
					.pipeline
					.send(&self.ctx.user.id, Some(&self.ctx.session_id), payload)
					.await
					.map(|_| ())
			}
			ClientEvent::TypingStart(target) => self.handle_typing_start(target.group_id).await,
			ClientEvent::TypingStop(target) => self.handle_typing_stop(target.group_id).await,
			ClientEvent::GetGroupMessages(query) => {
				let page = self.core.pipeline.history(&self.ctx.user.id, query).await?;
				self.ctx.handle.send(ServerEvent::GroupMessages(page));
				Ok(())
			}
			ClientEvent::GetRoomInfo(target) => self.handle_room_info(target.group_id).await,
		}
	}

	fn parse_group(&self, raw: String) -> Result<GroupId, ChatError> {
		GroupId::new(raw).map_err(|e| ChatError::Validation(e.to_string()))
	}

	async fn handle_join(&self, raw: String) -> Result<(), ChatError> {
		let group_id = self.parse_group(raw)?;

		if !self.core.oracle.is_member(&self.ctx.user.id, &group_id).await? {
			return Err(ChatError::Forbidden(format!("not a member of group {group_id}")));
		}

		let outcome = self
			.core
			.rooms
			.join(&group_id, self.ctx.handle.clone(), &self.ctx.user.name)
			.await;
		if outcome.first_join {
			metrics::counter!("decidr_server_room_first_joins_total").increment(1);
		}

		self.ctx.handle.send(ServerEvent::JoinedGroupSuccess {
			group_id: group_id.to_string(),
			member_count: outcome.member_count,
		});
		Ok(())
	}

	async fn handle_leave(&self, raw: String) -> Result<(), ChatError> {
		let group_id = self.parse_group(raw)?;

		let outcome = self
			.core
			.rooms
			.leave(&group_id, &self.ctx.session_id, &self.ctx.user.id, &self.ctx.user.name)
			.await;
		if outcome.last_leave {
			metrics::counter!("decidr_server_room_last_leaves_total").increment(1);
		}

		// Always reply, joined or not.
		self.ctx.handle.send(ServerEvent::LeftGroupSuccess {
			group_id: group_id.to_string(),
			member_count: outcome.member_count,
		});
		Ok(())
	}

	async fn handle_typing_start(&self, raw: String) -> Result<(), ChatError> {
		let group_id = self.parse_group(raw)?;

		if !self.core.oracle.is_member(&self.ctx.user.id, &group_id).await? {
			return Err(ChatError::Forbidden(format!("not a member of group {group_id}")));
		}
		if !self.core.rooms.is_joined(&group_id, &self.ctx.session_id).await {
			return Err(ChatError::Forbidden(format!("join group {group_id} before typing")));
		}

		// Repeated starts refresh the TTL and re-broadcast; clients coalesce.
		self.core.presence.mark_typing(&group_id, &self.ctx.user.id).await;
		self.core
			.rooms
			.broadcast(
				&group_id,
				ServerEvent::UserTyping {
					user_id: self.ctx.user.id.to_string(),
					user_name: self.ctx.user.name.clone(),
					group_id: group_id.to_string(),
				},
				Some(&self.ctx.session_id),
			)
			.await;
		Ok(())
	}

	async fn handle_typing_stop(&self, raw: String) -> Result<(), ChatError> {
		let group_id = self.parse_group(raw)?;

		self.core.presence.clear_typing(&group_id, &self.ctx.user.id).await;
		self.core
			.rooms
			.broadcast(
				&group_id,
				ServerEvent::UserStoppedTyping {
					user_id: self.ctx.user.id.to_string(),
					group_id: group_id.to_string(),
				},
				Some(&self.ctx.session_id),
			)
			.await;
		Ok(())
	}

	async fn handle_room_info(&self, raw: String) -> Result<(), ChatError> {
		let group_id = self.parse_group(raw)?;
		self.core
			.oracle
			.assert_group_access(&self.ctx.user.id, &group_id)
			.await?;

		let online = self.core.rooms.online_users(&group_id).await;
		self.ctx.handle.send(ServerEvent::RoomMembersUpdate {
			group_id: group_id.to_string(),
			member_count: online.len(),
			online_members: online.into_iter().map(|u| u.into_string()).collect(),
		});
		Ok(())
	}

	/// Cleanup on any exit path: leave every room this session is in, clear
	/// typing keys (with `user_stopped_typing` so no ghost indicators
	/// linger), and drop the socket from `user:{u}:sockets`. Runs once per
	/// session; the per-room leave is itself idempotent.
	pub async fn disconnect_sweep(&mut self) {
		if self.swept {
			return;
		}
		self.swept = true;

		let user_id = self.ctx.user.id.clone();
		let session_id = self.ctx.session_id;

		// Union of the registry's view and the cache's, so the sweep works
		// even when one of them is behind.
		let mut groups = self.core.rooms.groups_of_session(&session_id).await;
		for group_id in self.core.presence.rooms_of_user(&user_id).await {
			if !groups.contains(&group_id) {
				groups.push(group_id);
			}
		}

		let mut rooms_left = 0usize;
		for group_id in &groups {
			let outcome = self
				.core
				.rooms
				.leave(group_id, &session_id, &user_id, &self.ctx.user.name)
				.await;
			if outcome.was_joined {
				rooms_left += 1;
			}
		}

		for group_id in self.core.presence.typing_groups_of_user(&user_id).await {
			self.core.presence.clear_typing(&group_id, &user_id).await;
			self.core
				.rooms
				.broadcast(
					&group_id,
					ServerEvent::UserStoppedTyping {
						user_id: user_id.to_string(),
						group_id: group_id.to_string(),
					},
					Some(&session_id),
				)
				.await;
		}

		self.core.presence.untrack_socket(&user_id, &session_id).await;
		debug!(session = %session_id, rooms = rooms_left, "disconnect sweep complete");
	}
}
