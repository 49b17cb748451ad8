#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use decidr_domain::{ErrorCode, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding an inbound frame.
///
/// `Malformed` means the frame was not a JSON event object at all and the
/// session must be closed with a protocol-error close code. `Payload` means
/// the event name was recognized but its data did not match the schema; the
/// session stays open and the sender gets a VALIDATION_ERROR.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed frame: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("invalid payload for {event}: {source}")]
	Payload {
		event: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Outcome of decoding one inbound frame. Unknown events are surfaced so the
/// gateway can ignore them silently (and count them).
#[derive(Debug)]
pub enum InboundFrame {
	Event(ClientEvent),
	Unknown(String),
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
	/// Subscribe this session to a group's room. The payload is the bare
	/// group id string.
	JoinGroup(String),
	/// Unsubscribe this session from a group's room.
	LeaveGroup(String),
	SendMessage(SendMessagePayload),
	TypingStart(GroupTarget),
	TypingStop(GroupTarget),
	GetGroupMessages(HistoryQuery),
	GetRoomInfo(GroupTarget),
}

impl ClientEvent {
	/// Wire name of this event, for logs and rate-limit bookkeeping.
	pub const fn name(&self) -> &'static str {
		match self {
			ClientEvent::JoinGroup(_) => "join_group",
			ClientEvent::LeaveGroup(_) => "leave_group",
			ClientEvent::SendMessage(_) => "send_message",
			ClientEvent::TypingStart(_) => "typing_start",
			ClientEvent::TypingStop(_) => "typing_stop",
			ClientEvent::GetGroupMessages(_) => "get_group_messages",
			ClientEvent::GetRoomInfo(_) => "get_room_info",
		}
	}
}

/// Payload of `send_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
	pub group_id: String,
	pub content: String,
	#[serde(default, rename = "type")]
	pub kind: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to_id: Option<String>,
}

/// `{groupId}` payload shared by the typing events and `get_room_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTarget {
	pub group_id: String,
}

/// Payload of `get_group_messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
	pub group_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cursor: Option<String>,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
	MessageReceived(WireMessage),

	#[serde(rename_all = "camelCase")]
	UserTyping {
		user_id: String,
		user_name: String,
		group_id: String,
	},

	#[serde(rename_all = "camelCase")]
	UserStoppedTyping { user_id: String, group_id: String },

	GroupMessages(MessagePage),

	#[serde(rename_all = "camelCase")]
	UserJoinedGroup {
		user_id: String,
		user_name: String,
		group_id: String,
		member_count: usize,
	},

	#[serde(rename_all = "camelCase")]
	UserLeftGroup {
		user_id: String,
		user_name: String,
		group_id: String,
		member_count: usize,
	},

	#[serde(rename_all = "camelCase")]
	JoinedGroupSuccess { group_id: String, member_count: usize },

	#[serde(rename_all = "camelCase")]
	LeftGroupSuccess { group_id: String, member_count: usize },

	#[serde(rename_all = "camelCase")]
	RoomMembersUpdate {
		group_id: String,
		online_members: Vec<String>,
		member_count: usize,
	},

	Error { message: String, code: ErrorCode },
}

impl ServerEvent {
	pub const fn name(&self) -> &'static str {
		match self {
			ServerEvent::MessageReceived(_) => "message_received",
			ServerEvent::UserTyping { .. } => "user_typing",
			ServerEvent::UserStoppedTyping { .. } => "user_stopped_typing",
			ServerEvent::GroupMessages(_) => "group_messages",
			ServerEvent::UserJoinedGroup { .. } => "user_joined_group",
			ServerEvent::UserLeftGroup { .. } => "user_left_group",
			ServerEvent::JoinedGroupSuccess { .. } => "joined_group_success",
			ServerEvent::LeftGroupSuccess { .. } => "left_group_success",
			ServerEvent::RoomMembersUpdate { .. } => "room_members_update",
			ServerEvent::Error { .. } => "error",
		}
	}
}

/// Hydrated message as delivered over the wire: the stored row plus the
/// sender's user fields, the reply-parent snippet, and the attachment list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
	pub id: String,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageType,
	pub sender_id: String,
	pub group_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub user: WireUser,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<WireReply>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<WireAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
	pub id: String,
	pub name: String,
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReply {
	pub id: String,
	pub content: String,
	pub user: WireReplyUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReplyUser {
	pub id: String,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
	pub id: String,
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mime_type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub size: Option<i64>,
}

/// One page of history, oldest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
	pub messages: Vec<WireMessage>,
	pub has_next_page: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
	event: String,
	#[serde(default)]
	data: Value,
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, DecodeError> {
	serde_json::from_value(data).map_err(|source| DecodeError::Payload {
		event: event.to_string(),
		source,
	})
}

/// Decode one inbound text frame.
pub fn decode_client_event(text: &str) -> Result<InboundFrame, DecodeError> {
	let raw: RawFrame = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

	let event = match raw.event.as_str() {
		"join_group" => ClientEvent::JoinGroup(payload(&raw.event, raw.data)?),
		"leave_group" => ClientEvent::LeaveGroup(payload(&raw.event, raw.data)?),
		"send_message" => ClientEvent::SendMessage(payload(&raw.event, raw.data)?),
		"typing_start" => ClientEvent::TypingStart(payload(&raw.event, raw.data)?),
		"typing_stop" => ClientEvent::TypingStop(payload(&raw.event, raw.data)?),
		"get_group_messages" => ClientEvent::GetGroupMessages(payload(&raw.event, raw.data)?),
		"get_room_info" => ClientEvent::GetRoomInfo(payload(&raw.event, raw.data)?),
		_ => return Ok(InboundFrame::Unknown(raw.event)),
	};

	Ok(InboundFrame::Event(event))
}

/// Encode an outbound event as a JSON text frame.
pub fn encode_server_event(event: &ServerEvent) -> serde_json::Result<String> {
	serde_json::to_string(event)
}
