#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use decidr_domain::{GroupId, MessageId, MessageType, Role, UserId};
use tokio::sync::Mutex;

use crate::models::{
	AttachmentRecord, GroupRecord, HydratedMessage, MembershipView, NewMessage, ReplySnippet, UserRecord,
};
use crate::{ChatStore, StoreError};

/// In-memory store used in dev mode (no `database_url`) and by tests.
///
/// Messages live in a `BTreeMap` keyed by id, so a reverse range scan is
/// already newest-first for ULID ids.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	users: HashMap<UserId, UserRecord>,
	groups: HashMap<GroupId, GroupRecord>,
	members: BTreeMap<(GroupId, UserId), MemberRow>,
	messages: BTreeMap<MessageId, MessageRow>,
	attachments: HashMap<MessageId, Vec<AttachmentRecord>>,
}

#[derive(Clone)]
struct MemberRow {
	role: Role,
	joined_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
struct MessageRow {
	id: MessageId,
	group_id: GroupId,
	sender_id: UserId,
	kind: MessageType,
	content: String,
	reply_to_id: Option<MessageId>,
	created_at: chrono::DateTime<Utc>,
	updated_at: chrono::DateTime<Utc>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace a user row.
	pub async fn seed_user(&self, user: UserRecord) {
		let mut inner = self.inner.lock().await;
		inner.users.insert(user.id.clone(), user);
	}

	/// Insert a group and its creator's OWNER membership.
	pub async fn seed_group(&self, group: GroupRecord) {
		let mut inner = self.inner.lock().await;
		let key = (group.id.clone(), group.creator_id.clone());
		inner.members.entry(key).or_insert(MemberRow {
			role: Role::Owner,
			joined_at: group.created_at,
		});
		inner.groups.insert(group.id.clone(), group);
	}

	/// Attach a pre-existing attachment row to a message.
	pub async fn seed_attachment(&self, attachment: AttachmentRecord) {
		let mut inner = self.inner.lock().await;
		inner
			.attachments
			.entry(attachment.message_id.clone())
			.or_default()
			.push(attachment);
	}
}

impl Inner {
	fn membership_view(&self, group_id: &GroupId, user_id: &UserId) -> Option<MembershipView> {
		let row = self.members.get(&(group_id.clone(), user_id.clone()))?;
		let user = self.users.get(user_id)?.clone();
		Some(MembershipView {
			role: row.role,
			joined_at: row.joined_at,
			user,
		})
	}

	fn hydrate(&self, row: &MessageRow) -> Result<HydratedMessage, StoreError> {
		let sender = self
			.users
			.get(&row.sender_id)
			.cloned()
			.ok_or(StoreError::NotFound("message sender"))?;

		let reply_to = match &row.reply_to_id {
			Some(parent_id) => self.messages.get(parent_id).map(|parent| {
				let user_name = self
					.users
					.get(&parent.sender_id)
					.map(|u| u.name.clone())
					.unwrap_or_default();
				ReplySnippet {
					id: parent.id.clone(),
					content: parent.content.clone(),
					user_id: parent.sender_id.clone(),
					user_name,
				}
			}),
			None => None,
		};

		Ok(HydratedMessage {
			id: row.id.clone(),
			group_id: row.group_id.clone(),
			sender_id: row.sender_id.clone(),
			kind: row.kind,
			content: row.content.clone(),
			reply_to_id: row.reply_to_id.clone(),
			created_at: row.created_at,
			updated_at: row.updated_at,
			sender,
			reply_to,
			attachments: self.attachments.get(&row.id).cloned().unwrap_or_default(),
		})
	}

	fn has_other_owner(&self, group_id: &GroupId, except: &UserId) -> bool {
		self.members
			.iter()
			.any(|((g, u), row)| g == group_id && u != except && row.role == Role::Owner)
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn user_by_id(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.users.get(id).cloned())
	}

	async fn group_by_id(&self, id: &GroupId) -> Result<Option<GroupRecord>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.groups.get(id).cloned())
	}

	async fn membership(&self, user_id: &UserId, group_id: &GroupId) -> Result<Option<MembershipView>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.membership_view(group_id, user_id))
	}

	async fn members_of_group(&self, group_id: &GroupId) -> Result<Vec<MembershipView>, StoreError> {
		let inner = self.inner.lock().await;
		let mut out = Vec::new();
		for ((g, u), _) in inner.members.iter() {
			if g == group_id
				&& let Some(view) = inner.membership_view(g, u)
			{
				out.push(view);
			}
		}
		Ok(out)
	}

	async fn add_member(&self, group_id: &GroupId, user_id: &UserId, role: Role) -> Result<MembershipView, StoreError> {
		let mut inner = self.inner.lock().await;
		if !inner.groups.contains_key(group_id) {
			return Err(StoreError::NotFound("group"));
		}
		if !inner.users.contains_key(user_id) {
			return Err(StoreError::NotFound("user"));
		}

		let key = (group_id.clone(), user_id.clone());
		if inner.members.contains_key(&key) {
			return Err(StoreError::Conflict(format!("{user_id} is already a member of {group_id}")));
		}
		if role == Role::Owner && inner.has_other_owner(group_id, user_id) {
			return Err(StoreError::Conflict(format!("{group_id} already has an owner")));
		}

		inner.members.insert(
			key,
			MemberRow {
				role,
				joined_at: Utc::now(),
			},
		);
		inner
			.membership_view(group_id, user_id)
			.ok_or(StoreError::NotFound("membership"))
	}

	async fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		inner
			.members
			.remove(&(group_id.clone(), user_id.clone()))
			.map(|_| ())
			.ok_or(StoreError::NotFound("membership"))
	}

	async fn update_member_role(
		&self,
		group_id: &GroupId,
		user_id: &UserId,
		role: Role,
	) -> Result<MembershipView, StoreError> {
		let mut inner = self.inner.lock().await;
		if role == Role::Owner && inner.has_other_owner(group_id, user_id) {
			return Err(StoreError::Conflict(format!("{group_id} already has an owner")));
		}

		let key = (group_id.clone(), user_id.clone());
		let row = inner.members.get_mut(&key).ok_or(StoreError::NotFound("membership"))?;
		row.role = role;
		inner
			.membership_view(group_id, user_id)
			.ok_or(StoreError::NotFound("membership"))
	}

	async fn create_message(&self, input: NewMessage) -> Result<HydratedMessage, StoreError> {
		if input.kind.is_system() {
			return Err(StoreError::Conflict("SYSTEM messages are never persisted".to_string()));
		}

		let mut inner = self.inner.lock().await;
		if !inner.groups.contains_key(&input.group_id) {
			return Err(StoreError::NotFound("group"));
		}

		let now = Utc::now();
		let row = MessageRow {
			id: MessageId::generate(),
			group_id: input.group_id,
			sender_id: input.sender_id,
			kind: input.kind,
			content: input.content,
			reply_to_id: input.reply_to_id,
			created_at: now,
			updated_at: now,
		};
		let hydrated = inner.hydrate(&row)?;
		inner.messages.insert(row.id.clone(), row);
		Ok(hydrated)
	}

	async fn message_by_id(&self, id: &MessageId) -> Result<Option<HydratedMessage>, StoreError> {
		let inner = self.inner.lock().await;
		match inner.messages.get(id) {
			Some(row) => Ok(Some(inner.hydrate(row)?)),
			None => Ok(None),
		}
	}

	async fn messages_for_group(
		&self,
		group_id: &GroupId,
		cursor: Option<&MessageId>,
		limit: usize,
	) -> Result<Vec<HydratedMessage>, StoreError> {
		let inner = self.inner.lock().await;

		let mut out = Vec::with_capacity(limit);
		for (_, row) in inner.messages.iter().rev() {
			if out.len() >= limit {
				break;
			}
			if &row.group_id != group_id {
				continue;
			}
			if let Some(cursor) = cursor
				&& &row.id >= cursor
			{
				continue;
			}
			out.push(inner.hydrate(row)?);
		}
		Ok(out)
	}

	async fn update_message_content(&self, id: &MessageId, content: &str) -> Result<HydratedMessage, StoreError> {
		let mut inner = self.inner.lock().await;
		let row = inner.messages.get_mut(id).ok_or(StoreError::NotFound("message"))?;
		row.content = content.to_string();
		row.updated_at = Utc::now();
		let row = row.clone();
		inner.hydrate(&row)
	}

	async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		inner.messages.remove(id).ok_or(StoreError::NotFound("message"))?;
		inner.attachments.remove(id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str, name: &str) -> UserRecord {
		UserRecord {
			id: UserId::new(id).unwrap(),
			name: name.to_string(),
			email: format!("{id}@example.com"),
			email_verified: true,
			image: None,
		}
	}

	fn group(id: &str, creator: &str) -> GroupRecord {
		GroupRecord {
			id: GroupId::new(id).unwrap(),
			name: format!("group {id}"),
			description: None,
			is_private: false,
			creator_id: UserId::new(creator).unwrap(),
			created_at: Utc::now(),
		}
	}

	async fn seeded() -> MemoryStore {
		let store = MemoryStore::new();
		store.seed_user(user("alice", "Alice Johnson")).await;
		store.seed_user(user("bob", "Bob Stone")).await;
		store.seed_group(group("g1", "alice")).await;
		store
	}

	#[tokio::test]
	async fn creator_membership_is_owner() {
		let store = seeded().await;
		let membership = store
			.membership(&UserId::new("alice").unwrap(), &GroupId::new("g1").unwrap())
			.await
			.unwrap()
			.expect("creator membership");
		assert_eq!(membership.role, Role::Owner);
	}

	#[tokio::test]
	async fn duplicate_membership_conflicts() {
		let store = seeded().await;
		let g1 = GroupId::new("g1").unwrap();
		let bob = UserId::new("bob").unwrap();

		store.add_member(&g1, &bob, Role::Member).await.unwrap();
		let err = store.add_member(&g1, &bob, Role::Member).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");
	}

	#[tokio::test]
	async fn second_owner_conflicts() {
		let store = seeded().await;
		let g1 = GroupId::new("g1").unwrap();
		let bob = UserId::new("bob").unwrap();

		let err = store.add_member(&g1, &bob, Role::Owner).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");

		store.add_member(&g1, &bob, Role::Member).await.unwrap();
		let err = store.update_member_role(&g1, &bob, Role::Owner).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");
	}

	#[tokio::test]
	async fn ownership_transfer_demote_then_promote() {
		let store = seeded().await;
		let g1 = GroupId::new("g1").unwrap();
		let alice = UserId::new("alice").unwrap();
		let bob = UserId::new("bob").unwrap();
		store.add_member(&g1, &bob, Role::Admin).await.unwrap();

		store.update_member_role(&g1, &alice, Role::Admin).await.unwrap();
		let promoted = store.update_member_role(&g1, &bob, Role::Owner).await.unwrap();
		assert_eq!(promoted.role, Role::Owner);
	}

	#[tokio::test]
	async fn create_message_hydrates_sender_and_reply() {
		let store = seeded().await;
		let g1 = GroupId::new("g1").unwrap();

		let parent = store
			.create_message(NewMessage {
				group_id: g1.clone(),
				sender_id: UserId::new("alice").unwrap(),
				kind: MessageType::Text,
				content: "first".to_string(),
				reply_to_id: None,
			})
			.await
			.unwrap();
		assert_eq!(parent.sender.name, "Alice Johnson");
		assert!(parent.reply_to.is_none());

		let reply = store
			.create_message(NewMessage {
				group_id: g1.clone(),
				sender_id: UserId::new("bob").unwrap(),
				kind: MessageType::Text,
				content: "second".to_string(),
				reply_to_id: Some(parent.id.clone()),
			})
			.await
			.unwrap();

		let snippet = reply.reply_to.expect("reply snippet");
		assert_eq!(snippet.id, parent.id);
		assert_eq!(snippet.content, "first");
		assert_eq!(snippet.user_name, "Alice Johnson");
	}

	#[tokio::test]
	async fn system_messages_are_rejected() {
		let store = seeded().await;
		let err = store
			.create_message(NewMessage {
				group_id: GroupId::new("g1").unwrap(),
				sender_id: UserId::new("alice").unwrap(),
				kind: MessageType::System,
				content: "x joined".to_string(),
				reply_to_id: None,
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");
	}

	#[tokio::test]
	async fn pagination_walk_yields_every_message_once() {
		let store = seeded().await;
		let g1 = GroupId::new("g1").unwrap();
		let alice = UserId::new("alice").unwrap();

		for i in 1..=120 {
			store
				.create_message(NewMessage {
					group_id: g1.clone(),
					sender_id: alice.clone(),
					kind: MessageType::Text,
					content: format!("m{i:03}"),
					reply_to_id: None,
				})
				.await
				.unwrap();
		}

		// Walk newest-first pages of 50 until exhausted.
		let mut seen = Vec::new();
		let mut cursor: Option<MessageId> = None;
		loop {
			let page = store.messages_for_group(&g1, cursor.as_ref(), 50).await.unwrap();
			if page.is_empty() {
				break;
			}
			cursor = Some(page.last().unwrap().id.clone());
			seen.extend(page.into_iter().map(|m| m.content));
		}

		assert_eq!(seen.len(), 120);
		assert_eq!(seen.first().unwrap(), "m120");
		assert_eq!(seen.last().unwrap(), "m001");
	}

	#[tokio::test]
	async fn delete_cascades_attachments() {
		let store = seeded().await;
		let msg = store
			.create_message(NewMessage {
				group_id: GroupId::new("g1").unwrap(),
				sender_id: UserId::new("alice").unwrap(),
				kind: MessageType::Image,
				content: "photo".to_string(),
				reply_to_id: None,
			})
			.await
			.unwrap();

		store
			.seed_attachment(AttachmentRecord {
				id: "a1".to_string(),
				message_id: msg.id.clone(),
				url: "https://cdn.example.com/a1.png".to_string(),
				mime_type: Some("image/png".to_string()),
				size: Some(1024),
			})
			.await;

		let hydrated = store.message_by_id(&msg.id).await.unwrap().unwrap();
		assert_eq!(hydrated.attachments.len(), 1);

		store.delete_message(&msg.id).await.unwrap();
		assert!(store.message_by_id(&msg.id).await.unwrap().is_none());
		let inner = store.inner.lock().await;
		assert!(inner.attachments.get(&msg.id).is_none());
	}

	#[tokio::test]
	async fn update_content_advances_updated_at() {
		let store = seeded().await;
		let msg = store
			.create_message(NewMessage {
				group_id: GroupId::new("g1").unwrap(),
				sender_id: UserId::new("alice").unwrap(),
				kind: MessageType::Text,
				content: "typo".to_string(),
				reply_to_id: None,
			})
			.await
			.unwrap();

		let updated = store.update_message_content(&msg.id, "fixed").await.unwrap();
		assert_eq!(updated.content, "fixed");
		assert!(updated.updated_at >= msg.updated_at);
	}
}
