#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use decidr_domain::{GroupId, MAX_TEXT_CONTENT_CHARS, MessageId, MessageType, Role, SYSTEM_SENDER_ID, SessionId, UserId};
use decidr_protocol::{
	HistoryQuery, MessagePage, SendMessagePayload, ServerEvent, WireAttachment, WireMessage, WireReply, WireReplyUser,
	WireUser,
};
use decidr_store::{ChatStore, HydratedMessage, NewMessage};
use tracing::debug;

use crate::server::auth::AuthOracle;
use crate::server::error::ChatError;
use crate::server::presence::PresenceCache;
use crate::server::rooms::RoomManager;

/// Hard cap on a history page; requests above it are clamped, not rejected.
pub const HISTORY_MAX_LIMIT: usize = 100;
/// Page size when the client does not ask for one.
pub const HISTORY_DEFAULT_LIMIT: usize = 50;

/// Validate, authorize, persist, hydrate, and broadcast messages; serve
/// cursor-paginated history. Sole writer of Message rows.
#[derive(Clone)]
pub struct MessagePipeline {
	store: Arc<dyn ChatStore>,
	oracle: AuthOracle,
	rooms: RoomManager,
	presence: PresenceCache,
}

impl MessagePipeline {
	pub fn new(store: Arc<dyn ChatStore>, oracle: AuthOracle, rooms: RoomManager, presence: PresenceCache) -> Self {
		Self {
			store,
			oracle,
			rooms,
			presence,
		}
	}

	/// Send a message. `session` is present on the socket path, where the
	/// sender must have joined the room; the REST path passes `None` and only
	/// requires membership. A failed send never produces a broadcast.
	pub async fn send(
		&self,
		user_id: &UserId,
		session: Option<&SessionId>,
		input: SendMessagePayload,
	) -> Result<WireMessage, ChatError> {
		let content = input.content.trim().to_string();
		if content.is_empty() {
			return Err(ChatError::Validation("message content must not be empty".to_string()));
		}
		if input.kind == MessageType::Text && content.chars().count() > MAX_TEXT_CONTENT_CHARS {
			return Err(ChatError::Validation(format!(
				"message content exceeds {MAX_TEXT_CONTENT_CHARS} characters"
			)));
		}
		if input.kind.is_system() {
			return Err(ChatError::Validation("clients cannot send SYSTEM messages".to_string()));
		}

		let group_id = GroupId::new(input.group_id).map_err(|e| ChatError::Validation(e.to_string()))?;

		if !self.oracle.is_member(user_id, &group_id).await? {
			return Err(ChatError::Forbidden(format!("not a member of group {group_id}")));
		}

		if let Some(session_id) = session
			&& !self.rooms.is_joined(&group_id, session_id).await
		{
			return Err(ChatError::Forbidden(format!("join group {group_id} before sending")));
		}

		let reply_to_id = match input.reply_to_id {
			Some(raw) => {
				let parent_id = MessageId::new(raw).map_err(|e| ChatError::Validation(e.to_string()))?;
				let parent = self
					.store
					.message_by_id(&parent_id)
					.await?
					.ok_or_else(|| ChatError::Validation(format!("reply target {parent_id} does not exist")))?;
				if parent.group_id != group_id {
					return Err(ChatError::Validation(format!(
						"reply target {parent_id} belongs to another group"
					)));
				}
				Some(parent_id)
			}
			None => None,
		};

		let hydrated = self
			.store
			.create_message(NewMessage {
				group_id: group_id.clone(),
				sender_id: user_id.clone(),
				kind: input.kind,
				content,
				reply_to_id,
			})
			.await?;
		metrics::counter!("decidr_server_messages_persisted_total").increment(1);

		// The sender hears their own message through the room broadcast;
		// there is no separate echo.
		let wire = to_wire(&hydrated);
		self.rooms
			.broadcast(&group_id, ServerEvent::MessageReceived(wire.clone()), None)
			.await;

		// Sending implies no longer typing.
		self.presence.clear_typing(&group_id, user_id).await;
		self.rooms
			.broadcast(
				&group_id,
				ServerEvent::UserStoppedTyping {
					user_id: user_id.to_string(),
					group_id: group_id.to_string(),
				},
				session,
			)
			.await;

		Ok(wire)
	}

	/// Cursor-paginated history, oldest-first within the page.
	pub async fn history(&self, user_id: &UserId, query: HistoryQuery) -> Result<MessagePage, ChatError> {
		let group_id = GroupId::new(query.group_id).map_err(|e| ChatError::Validation(e.to_string()))?;
		self.oracle.assert_group_access(user_id, &group_id).await?;

		let limit = query
			.limit
			.map(|l| (l as usize).clamp(1, HISTORY_MAX_LIMIT))
			.unwrap_or(HISTORY_DEFAULT_LIMIT);

		let cursor = query
			.cursor
			.map(MessageId::new)
			.transpose()
			.map_err(|e| ChatError::Validation(e.to_string()))?;

		// Fetch one extra row to learn whether an older page exists.
		let mut rows = self
			.store
			.messages_for_group(&group_id, cursor.as_ref(), limit + 1)
			.await?;

		let has_next_page = rows.len() > limit;
		if has_next_page {
			rows.truncate(limit);
		}

		// Rows are newest-first; the oldest surviving row is the next cursor.
		let next_cursor = if has_next_page {
			rows.last().map(|m| m.id.to_string())
		} else {
			None
		};

		rows.reverse();
		debug!(group = %group_id, returned = rows.len(), has_next_page, "history page");

		Ok(MessagePage {
			messages: rows.iter().map(to_wire).collect(),
			has_next_page,
			next_cursor,
		})
	}

	/// Hydrate a single message. Requires access to its group.
	pub async fn get(&self, user_id: &UserId, message_id: &MessageId) -> Result<WireMessage, ChatError> {
		let message = self
			.store
			.message_by_id(message_id)
			.await?
			.ok_or_else(|| ChatError::NotFound(format!("message {message_id} not found")))?;
		self.oracle.assert_group_access(user_id, &message.group_id).await?;
		Ok(to_wire(&message))
	}

	/// Edit content. Only the sender may edit; no broadcast is emitted.
	pub async fn update(&self, user_id: &UserId, message_id: &MessageId, content: &str) -> Result<WireMessage, ChatError> {
		let content = content.trim();
		if content.is_empty() {
			return Err(ChatError::Validation("message content must not be empty".to_string()));
		}
		if content.chars().count() > MAX_TEXT_CONTENT_CHARS {
			return Err(ChatError::Validation(format!(
				"message content exceeds {MAX_TEXT_CONTENT_CHARS} characters"
			)));
		}

		let message = self
			.store
			.message_by_id(message_id)
			.await?
			.ok_or_else(|| ChatError::NotFound(format!("message {message_id} not found")))?;
		if message.sender_id != *user_id {
			return Err(ChatError::Forbidden("only the sender may edit a message".to_string()));
		}

		let updated = self.store.update_message_content(message_id, content).await?;
		Ok(to_wire(&updated))
	}

	/// Delete. Allowed for the sender, the group owner, or any admin.
	/// Attachments cascade; no broadcast is emitted.
	pub async fn delete(&self, user_id: &UserId, message_id: &MessageId) -> Result<(), ChatError> {
		let message = self
			.store
			.message_by_id(message_id)
			.await?
			.ok_or_else(|| ChatError::NotFound(format!("message {message_id} not found")))?;

		if message.sender_id != *user_id {
			let role = self
				.oracle
				.membership(user_id, &message.group_id)
				.await?
				.map(|m| m.role);
			if !matches!(role, Some(Role::Owner) | Some(Role::Admin)) {
				return Err(ChatError::Forbidden(
					"only the sender, the owner, or an admin may delete a message".to_string(),
				));
			}
		}

		self.store.delete_message(message_id).await?;
		Ok(())
	}
}

/// Map a hydrated store record to its wire shape.
pub fn to_wire(message: &HydratedMessage) -> WireMessage {
	WireMessage {
		id: message.id.to_string(),
		content: message.content.clone(),
		kind: message.kind,
		sender_id: message.sender_id.to_string(),
		group_id: message.group_id.to_string(),
		reply_to_id: message.reply_to_id.as_ref().map(|m| m.to_string()),
		created_at: message.created_at,
		user: WireUser {
			id: message.sender.id.to_string(),
			name: message.sender.name.clone(),
			email: message.sender.email.clone(),
			image: message.sender.image.clone(),
		},
		reply_to: message.reply_to.as_ref().map(|reply| WireReply {
			id: reply.id.to_string(),
			content: reply.content.clone(),
			user: WireReplyUser {
				id: reply.user_id.to_string(),
				name: reply.user_name.clone(),
			},
		}),
		attachments: message
			.attachments
			.iter()
			.map(|a| WireAttachment {
				id: a.id.clone(),
				url: a.url.clone(),
				mime_type: a.mime_type.clone(),
				size: a.size,
			})
			.collect(),
	}
}

/// Synthesize an ephemeral SYSTEM message for fan-out. Never persisted:
/// clients distinguish these by `type` alone.
pub fn system_message(group_id: &GroupId, content: String) -> WireMessage {
	WireMessage {
		id: format!("system-{}", MessageId::generate()),
		content,
		kind: MessageType::System,
		sender_id: SYSTEM_SENDER_ID.to_string(),
		group_id: group_id.to_string(),
		reply_to_id: None,
		created_at: Utc::now(),
		user: WireUser {
			id: SYSTEM_SENDER_ID.to_string(),
			name: "System".to_string(),
			email: String::new(),
			image: None,
		},
		reply_to: None,
		attachments: Vec::new(),
	}
}
