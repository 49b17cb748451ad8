#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use decidr_domain::{GroupId, MessageId, MessageType, Role, UserId};

/// Durable user row as consumed by the chat core.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
	pub id: UserId,
	pub name: String,
	pub email: String,
	pub email_verified: bool,
	pub image: Option<String>,
}

/// Durable group row.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
	pub id: GroupId,
	pub name: String,
	pub description: Option<String>,
	pub is_private: bool,
	pub creator_id: UserId,
	pub created_at: DateTime<Utc>,
}

/// Membership joined with the member's user record.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipView {
	pub role: Role,
	pub joined_at: DateTime<Utc>,
	pub user: UserRecord,
}

/// Input for persisting a message. The store assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub group_id: GroupId,
	pub sender_id: UserId,
	pub kind: MessageType,
	pub content: String,
	pub reply_to_id: Option<MessageId>,
}

/// Reply-parent snippet carried by a hydrated message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySnippet {
	pub id: MessageId,
	pub content: String,
	pub user_id: UserId,
	pub user_name: String,
}

/// Attachment row, cascade-deleted with its message.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
	pub id: String,
	pub message_id: MessageId,
	pub url: String,
	pub mime_type: Option<String>,
	pub size: Option<i64>,
}

/// Message row augmented with sender, reply snippet, and attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedMessage {
	pub id: MessageId,
	pub group_id: GroupId,
	pub sender_id: UserId,
	pub kind: MessageType,
	pub content: String,
	pub reply_to_id: Option<MessageId>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub sender: UserRecord,
	pub reply_to: Option<ReplySnippet>,
	pub attachments: Vec<AttachmentRecord>,
}
