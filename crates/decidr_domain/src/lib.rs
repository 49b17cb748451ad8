#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum character count for TEXT message content (after trimming).
pub const MAX_TEXT_CONTENT_CHARS: usize = 5000;

/// Sender id carried by synthesized SYSTEM messages. Never a real user row.
pub const SYSTEM_SENDER_ID: &str = "system";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown message type: {0}")]
	UnknownMessageType(String),
	#[error("invalid session id: {0}")]
	InvalidSessionId(String),
}

macro_rules! string_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Durable user identifier.
	UserId
);

string_id!(
	/// Durable group identifier. A group's live session set is its room.
	GroupId
);

string_id!(
	/// Message identifier. Generated ids are ULIDs, so lexicographic order on
	/// the id column matches insertion order and the id doubles as a history
	/// cursor.
	MessageId
);

impl MessageId {
	/// Mint a new monotonic message id.
	pub fn generate() -> Self {
		Self(ulid::Ulid::new().to_string())
	}
}

/// A single authenticated client connection. A user may hold many at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim())
			.map(Self)
			.map_err(|_| ParseIdError::InvalidSessionId(s.to_string()))
	}
}

/// Membership role within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
	Owner,
	Admin,
	Member,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Owner => "OWNER",
			Role::Admin => "ADMIN",
			Role::Member => "MEMBER",
		}
	}

	/// Whether this role may add a new member to the group.
	pub const fn may_add_member(self) -> bool {
		matches!(self, Role::Owner | Role::Admin)
	}

	/// Whether this role may remove a member holding `target`.
	///
	/// Owners are never removable (ownership must be transferred first), not
	/// even by themselves. Anyone else may remove themselves.
	pub const fn may_remove(self, target: Role, removing_self: bool) -> bool {
		if matches!(target, Role::Owner) {
			return false;
		}
		if removing_self {
			return true;
		}
		match (self, target) {
			(Role::Owner, _) => true,
			(Role::Admin, Role::Member) => true,
			_ => false,
		}
	}

	/// Whether this role may change `target`'s role to `new_role`.
	///
	/// Promoting to OWNER is an ownership transfer and is reserved to the
	/// current owner; the owner's own role only changes through that path.
	pub const fn may_change_role(self, target: Role, new_role: Role) -> bool {
		if matches!(target, Role::Owner) {
			return false;
		}
		match new_role {
			Role::Owner => matches!(self, Role::Owner),
			Role::Admin | Role::Member => matches!(self, Role::Owner | Role::Admin),
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"OWNER" => Ok(Role::Owner),
			"ADMIN" => Ok(Role::Admin),
			"MEMBER" => Ok(Role::Member),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Message payload kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
	#[default]
	Text,
	Image,
	File,
	System,
}

impl MessageType {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::Text => "TEXT",
			MessageType::Image => "IMAGE",
			MessageType::File => "FILE",
			MessageType::System => "SYSTEM",
		}
	}

	/// SYSTEM messages are synthesized for fan-out only and never persisted.
	pub const fn is_system(self) -> bool {
		matches!(self, MessageType::System)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"TEXT" => Ok(MessageType::Text),
			"IMAGE" => Ok(MessageType::Image),
			"FILE" => Ok(MessageType::File),
			"SYSTEM" => Ok(MessageType::System),
			other => Err(ParseIdError::UnknownMessageType(other.to_string())),
		}
	}
}

/// Error code carried by `error` events and REST error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	ValidationError,
	Unauthorized,
	Forbidden,
	NotFound,
	Conflict,
	InternalError,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::ValidationError => "VALIDATION_ERROR",
			ErrorCode::Unauthorized => "UNAUTHORIZED",
			ErrorCode::Forbidden => "FORBIDDEN",
			ErrorCode::NotFound => "NOT_FOUND",
			ErrorCode::Conflict => "CONFLICT",
			ErrorCode::InternalError => "INTERNAL_ERROR",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
