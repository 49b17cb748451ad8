#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use decidr_domain::{GroupId, MessageId, MessageType, Role, UserId};

use crate::models::{
	AttachmentRecord, GroupRecord, HydratedMessage, MembershipView, NewMessage, ReplySnippet, UserRecord,
};
use crate::{ChatStore, StoreError};

/// sqlx-backed store over SQLite or Postgres, selected by the URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

#[derive(sqlx::FromRow)]
struct UserRow {
	id: String,
	name: String,
	email: String,
	email_verified: bool,
	image: Option<String>,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
	id: String,
	name: String,
	description: Option<String>,
	is_private: bool,
	creator_id: String,
	created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MemberRow {
	role: String,
	joined_at: DateTime<Utc>,
	user_id: String,
	user_name: String,
	user_email: String,
	user_email_verified: bool,
	user_image: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
	id: String,
	group_id: String,
	sender_id: String,
	#[sqlx(rename = "type")]
	kind: String,
	content: String,
	reply_to_id: Option<String>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ReplyRow {
	id: String,
	content: String,
	user_id: String,
	user_name: String,
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
	id: String,
	message_id: String,
	url: String,
	mime_type: Option<String>,
	size: Option<i64>,
}

const MEMBER_SELECT: &str = "SELECT gm.role, gm.joined_at, u.id AS user_id, u.name AS user_name, \
	u.email AS user_email, u.email_verified AS user_email_verified, u.image AS user_image \
	FROM group_members gm JOIN users u ON u.id = gm.user_id";

impl TryFrom<UserRow> for UserRecord {
	type Error = StoreError;

	fn try_from(row: UserRow) -> Result<Self, StoreError> {
		Ok(UserRecord {
			id: UserId::new(row.id).context("user id")?,
			name: row.name,
			email: row.email,
			email_verified: row.email_verified,
			image: row.image,
		})
	}
}

impl TryFrom<GroupRow> for GroupRecord {
	type Error = StoreError;

	fn try_from(row: GroupRow) -> Result<Self, StoreError> {
		Ok(GroupRecord {
			id: GroupId::new(row.id).context("group id")?,
			name: row.name,
			description: row.description,
			is_private: row.is_private,
			creator_id: UserId::new(row.creator_id).context("group creator id")?,
			created_at: row.created_at,
		})
	}
}

impl TryFrom<MemberRow> for MembershipView {
	type Error = StoreError;

	fn try_from(row: MemberRow) -> Result<Self, StoreError> {
		Ok(MembershipView {
			role: row.role.parse::<Role>().context("member role")?,
			joined_at: row.joined_at,
			user: UserRecord {
				id: UserId::new(row.user_id).context("member user id")?,
				name: row.user_name,
				email: row.user_email,
				email_verified: row.user_email_verified,
				image: row.user_image,
			},
		})
	}
}

impl TryFrom<AttachmentRow> for AttachmentRecord {
	type Error = StoreError;

	fn try_from(row: AttachmentRow) -> Result<Self, StoreError> {
		Ok(AttachmentRecord {
			id: row.id,
			message_id: MessageId::new(row.message_id).context("attachment message id")?,
			url: row.url,
			mime_type: row.mime_type,
			size: row.size,
		})
	}
}

impl SqlStore {
	/// Connect and run migrations. Accepts `sqlite:` and `postgres:` URLs.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	async fn fetch_message_row(&self, id: &MessageId) -> Result<Option<MessageRow>, StoreError> {
		let row: Option<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT * FROM messages WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT * FROM messages WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select message (postgres)")?,
		};
		Ok(row)
	}

	async fn hydrate(&self, row: MessageRow) -> Result<HydratedMessage, StoreError> {
		let sender_id = UserId::new(row.sender_id).context("message sender id")?;
		let sender = self
			.user_by_id(&sender_id)
			.await?
			.ok_or_else(|| StoreError::Backend(anyhow!("message {} has no sender row", row.id)))?;

		let reply_to = match &row.reply_to_id {
			Some(parent_id) => {
				let reply: Option<ReplyRow> = match &self.backend {
					SqlBackend::Sqlite(pool) => sqlx::query_as(
						"SELECT m.id, m.content, u.id AS user_id, u.name AS user_name \
						FROM messages m JOIN users u ON u.id = m.sender_id WHERE m.id = ?",
					)
					.bind(parent_id)
					.fetch_optional(pool)
					.await
					.context("select reply parent (sqlite)")?,
					SqlBackend::Postgres(pool) => sqlx::query_as(
						"SELECT m.id, m.content, u.id AS user_id, u.name AS user_name \
						FROM messages m JOIN users u ON u.id = m.sender_id WHERE m.id = $1",
					)
					.bind(parent_id)
					.fetch_optional(pool)
					.await
					.context("select reply parent (postgres)")?,
				};
				match reply {
					Some(r) => Some(ReplySnippet {
						id: MessageId::new(r.id).context("reply id")?,
						content: r.content,
						user_id: UserId::new(r.user_id).context("reply user id")?,
						user_name: r.user_name,
					}),
					None => None,
				}
			}
			None => None,
		};

		let attachment_rows: Vec<AttachmentRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT * FROM attachments WHERE message_id = ? ORDER BY id")
				.bind(&row.id)
				.fetch_all(pool)
				.await
				.context("select attachments (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT * FROM attachments WHERE message_id = $1 ORDER BY id")
				.bind(&row.id)
				.fetch_all(pool)
				.await
				.context("select attachments (postgres)")?,
		};
		let attachments = attachment_rows
			.into_iter()
			.map(AttachmentRecord::try_from)
			.collect::<Result<Vec<_>, _>>()?;

		let reply_to_id = row.reply_to_id.map(MessageId::new).transpose().context("reply_to id")?;

		Ok(HydratedMessage {
			id: MessageId::new(row.id).context("message id")?,
			group_id: GroupId::new(row.group_id).context("message group id")?,
			sender_id,
			kind: row.kind.parse::<MessageType>().context("message type")?,
			content: row.content,
			reply_to_id,
			created_at: row.created_at,
			updated_at: row.updated_at,
			sender,
			reply_to,
			attachments,
		})
	}

	async fn owner_exists_excluding(&self, group_id: &GroupId, except: &UserId) -> Result<bool, StoreError> {
		let count: (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM group_members WHERE group_id = ? AND role = 'OWNER' AND user_id <> ?",
			)
			.bind(group_id.as_str())
			.bind(except.as_str())
			.fetch_one(pool)
			.await
			.context("count owners (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND role = 'OWNER' AND user_id <> $2",
			)
			.bind(group_id.as_str())
			.bind(except.as_str())
			.fetch_one(pool)
			.await
			.context("count owners (postgres)")?,
		};
		Ok(count.0 > 0)
	}
}

#[async_trait]
impl ChatStore for SqlStore {
	async fn user_by_id(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT * FROM users WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select user (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT * FROM users WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select user (postgres)")?,
		};
		row.map(UserRecord::try_from).transpose()
	}

	async fn group_by_id(&self, id: &GroupId) -> Result<Option<GroupRecord>, StoreError> {
		let row: Option<GroupRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT * FROM chat_groups WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select group (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT * FROM chat_groups WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select group (postgres)")?,
		};
		row.map(GroupRecord::try_from).transpose()
	}

	async fn membership(&self, user_id: &UserId, group_id: &GroupId) -> Result<Option<MembershipView>, StoreError> {
		let sql_sqlite = format!("{MEMBER_SELECT} WHERE gm.user_id = ? AND gm.group_id = ?");
		let sql_postgres = format!("{MEMBER_SELECT} WHERE gm.user_id = $1 AND gm.group_id = $2");

		let row: Option<MemberRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_sqlite)
				.bind(user_id.as_str())
				.bind(group_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select membership (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&sql_postgres)
				.bind(user_id.as_str())
				.bind(group_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select membership (postgres)")?,
		};
		row.map(MembershipView::try_from).transpose()
	}

	async fn members_of_group(&self, group_id: &GroupId) -> Result<Vec<MembershipView>, StoreError> {
		let sql_sqlite = format!("{MEMBER_SELECT} WHERE gm.group_id = ? ORDER BY gm.joined_at");
		let sql_postgres = format!("{MEMBER_SELECT} WHERE gm.group_id = $1 ORDER BY gm.joined_at");

		let rows: Vec<MemberRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_sqlite)
				.bind(group_id.as_str())
				.fetch_all(pool)
				.await
				.context("select members (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&sql_postgres)
				.bind(group_id.as_str())
				.fetch_all(pool)
				.await
				.context("select members (postgres)")?,
		};
		rows.into_iter().map(MembershipView::try_from).collect()
	}

	async fn add_member(&self, group_id: &GroupId, user_id: &UserId, role: Role) -> Result<MembershipView, StoreError> {
		if self.group_by_id(group_id).await?.is_none() {
			return Err(StoreError::NotFound("group"));
		}
		if self.user_by_id(user_id).await?.is_none() {
			return Err(StoreError::NotFound("user"));
		}
		if self.membership(user_id, group_id).await?.is_some() {
			return Err(StoreError::Conflict(format!("{user_id} is already a member of {group_id}")));
		}
		if role == Role::Owner && self.owner_exists_excluding(group_id, user_id).await? {
			return Err(StoreError::Conflict(format!("{group_id} already has an owner")));
		}

		let now = Utc::now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO group_members (user_id, group_id, role, joined_at) VALUES (?, ?, ?, ?)")
					.bind(user_id.as_str())
					.bind(group_id.as_str())
					.bind(role.as_str())
					.bind(now)
					.execute(pool)
					.await
					.context("insert membership (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO group_members (user_id, group_id, role, joined_at) VALUES ($1, $2, $3, $4)")
					.bind(user_id.as_str())
					.bind(group_id.as_str())
					.bind(role.as_str())
					.bind(now)
					.execute(pool)
					.await
					.context("insert membership (postgres)")?;
			}
		}

		self.membership(user_id, group_id)
			.await?
			.ok_or(StoreError::NotFound("membership"))
	}

	async fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM group_members WHERE user_id = ? AND group_id = ?")
				.bind(user_id.as_str())
				.bind(group_id.as_str())
				.execute(pool)
				.await
				.context("delete membership (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM group_members WHERE user_id = $1 AND group_id = $2")
				.bind(user_id.as_str())
				.bind(group_id.as_str())
				.execute(pool)
				.await
				.context("delete membership (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("membership"));
		}
		Ok(())
	}

	async fn update_member_role(
		&self,
		group_id: &GroupId,
		user_id: &UserId,
		role: Role,
	) -> Result<MembershipView, StoreError> {
		if role == Role::Owner && self.owner_exists_excluding(group_id, user_id).await? {
			return Err(StoreError::Conflict(format!("{group_id} already has an owner")));
		}

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE group_members SET role = ? WHERE user_id = ? AND group_id = ?")
				.bind(role.as_str())
				.bind(user_id.as_str())
				.bind(group_id.as_str())
				.execute(pool)
				.await
				.context("update member role (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE group_members SET role = $1 WHERE user_id = $2 AND group_id = $3")
					.bind(role.as_str())
					.bind(user_id.as_str())
					.bind(group_id.as_str())
					.execute(pool)
					.await
					.context("update member role (postgres)")?
					.rows_affected()
			}
		};
		if affected == 0 {
			return Err(StoreError::NotFound("membership"));
		}

		self.membership(user_id, group_id)
			.await?
			.ok_or(StoreError::NotFound("membership"))
	}

	async fn create_message(&self, input: NewMessage) -> Result<HydratedMessage, StoreError> {
		if input.kind.is_system() {
			return Err(StoreError::Conflict("SYSTEM messages are never persisted".to_string()));
		}

		let id = MessageId::generate();
		let now = Utc::now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, group_id, sender_id, type, content, reply_to_id, created_at, updated_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(id.as_str())
				.bind(input.group_id.as_str())
				.bind(input.sender_id.as_str())
				.bind(input.kind.as_str())
				.bind(&input.content)
				.bind(input.reply_to_id.as_ref().map(|m| m.as_str()))
				.bind(now)
				.bind(now)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, group_id, sender_id, type, content, reply_to_id, created_at, updated_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(id.as_str())
				.bind(input.group_id.as_str())
				.bind(input.sender_id.as_str())
				.bind(input.kind.as_str())
				.bind(&input.content)
				.bind(input.reply_to_id.as_ref().map(|m| m.as_str()))
				.bind(now)
				.bind(now)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}

		// Read back hydrated, per the write-path contract.
		self.message_by_id(&id).await?.ok_or(StoreError::NotFound("message"))
	}

	async fn message_by_id(&self, id: &MessageId) -> Result<Option<HydratedMessage>, StoreError> {
		match self.fetch_message_row(id).await? {
			Some(row) => Ok(Some(self.hydrate(row).await?)),
			None => Ok(None),
		}
	}

	async fn messages_for_group(
		&self,
		group_id: &GroupId,
		cursor: Option<&MessageId>,
		limit: usize,
	) -> Result<Vec<HydratedMessage>, StoreError> {
		let limit = limit as i64;
		let rows: Vec<MessageRow> = match (&self.backend, cursor) {
			(SqlBackend::Sqlite(pool), Some(cursor)) => sqlx::query_as(
				"SELECT * FROM messages WHERE group_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
			)
			.bind(group_id.as_str())
			.bind(cursor.as_str())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select messages page (sqlite)")?,
			(SqlBackend::Sqlite(pool), None) => {
				sqlx::query_as("SELECT * FROM messages WHERE group_id = ? ORDER BY id DESC LIMIT ?")
					.bind(group_id.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select messages page (sqlite)")?
			}
			(SqlBackend::Postgres(pool), Some(cursor)) => sqlx::query_as(
				"SELECT * FROM messages WHERE group_id = $1 AND id < $2 ORDER BY id DESC LIMIT $3",
			)
			.bind(group_id.as_str())
			.bind(cursor.as_str())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select messages page (postgres)")?,
			(SqlBackend::Postgres(pool), None) => {
				sqlx::query_as("SELECT * FROM messages WHERE group_id = $1 ORDER BY id DESC LIMIT $2")
					.bind(group_id.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select messages page (postgres)")?
			}
		};

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			out.push(self.hydrate(row).await?);
		}
		Ok(out)
	}

	async fn update_message_content(&self, id: &MessageId, content: &str) -> Result<HydratedMessage, StoreError> {
		let now = Utc::now();
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE messages SET content = ?, updated_at = ? WHERE id = ?")
				.bind(content)
				.bind(now)
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("update message (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE messages SET content = $1, updated_at = $2 WHERE id = $3")
				.bind(content)
				.bind(now)
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("update message (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("message"));
		}
		self.message_by_id(id).await?.ok_or(StoreError::NotFound("message"))
	}

	async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError> {
		// Attachment rows cascade via the FK.
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM messages WHERE id = ?")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete message (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM messages WHERE id = $1")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete message (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("message"));
		}
		Ok(())
	}
}
