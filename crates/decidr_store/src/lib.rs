#![forbid(unsafe_code)]

pub mod memory;
pub mod models;
pub mod sql;

use async_trait::async_trait;
use decidr_domain::{GroupId, MessageId, Role, UserId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use models::{
	AttachmentRecord, GroupRecord, HydratedMessage, MembershipView, NewMessage, ReplySnippet, UserRecord,
};
pub use sql::SqlStore;

/// Errors surfaced by the repository.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("not found: {0}")]
	NotFound(&'static str),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// The durable store as consumed by the chat core.
///
/// Implementations must guarantee that message ids are comparable as history
/// cursors: `id < cursor` yields a total order consistent with
/// `created_at DESC`. The core only ever inserts ULIDs, which satisfy this.
#[async_trait]
pub trait ChatStore: Send + Sync {
	async fn user_by_id(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError>;

	async fn group_by_id(&self, id: &GroupId) -> Result<Option<GroupRecord>, StoreError>;

	/// Membership row joined with the member's user record.
	async fn membership(&self, user_id: &UserId, group_id: &GroupId) -> Result<Option<MembershipView>, StoreError>;

	async fn members_of_group(&self, group_id: &GroupId) -> Result<Vec<MembershipView>, StoreError>;

	/// Fails with `Conflict` on duplicate membership or a second OWNER.
	async fn add_member(&self, group_id: &GroupId, user_id: &UserId, role: Role) -> Result<MembershipView, StoreError>;

	async fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<(), StoreError>;

	/// Fails with `Conflict` when the new role is OWNER and another member
	/// already holds it.
	async fn update_member_role(
		&self,
		group_id: &GroupId,
		user_id: &UserId,
		role: Role,
	) -> Result<MembershipView, StoreError>;

	/// Persist a message and read it back hydrated. SYSTEM messages are
	/// rejected; they exist only as ephemeral fan-out.
	async fn create_message(&self, input: NewMessage) -> Result<HydratedMessage, StoreError>;

	async fn message_by_id(&self, id: &MessageId) -> Result<Option<HydratedMessage>, StoreError>;

	/// Messages of a group ordered newest-first, strictly older than `cursor`
	/// when one is given, at most `limit` rows.
	async fn messages_for_group(
		&self,
		group_id: &GroupId,
		cursor: Option<&MessageId>,
		limit: usize,
	) -> Result<Vec<HydratedMessage>, StoreError>;

	async fn update_message_content(&self, id: &MessageId, content: &str) -> Result<HydratedMessage, StoreError>;

	/// Delete a message, cascading to its attachments.
	async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError>;
}
