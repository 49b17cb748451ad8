#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use decidr_domain::{GroupId, UserId};
use decidr_store::{ChatStore, GroupRecord, MembershipView, UserRecord};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::server::error::ChatError;

/// Issuer baked into every access token.
pub const TOKEN_ISSUER: &str = "decidr-backend";
/// Audience baked into every access token.
pub const TOKEN_AUDIENCE: &str = "decidr-client";
/// Token kind accepted by the gateway handshake and the REST middleware.
pub const TOKEN_KIND_ACCESS: &str = "access";
/// Token kind rejected everywhere in the chat core.
#[allow(dead_code)]
pub const TOKEN_KIND_REFRESH: &str = "refresh";

/// Claims carried by a decidr token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub email: String,
	#[serde(default)]
	pub email_verified: bool,
	pub kind: String,
	pub iss: String,
	pub aud: String,
	pub iat: u64,
	pub exp: u64,
}

/// Identity bound to a session or request after token verification.
#[derive(Debug, Clone)]
pub struct AuthedUser {
	pub user_id: UserId,
	pub email: String,
	pub email_verified: bool,
}

/// Pure token verification against the asymmetric public key.
pub struct TokenVerifier {
	decoding: DecodingKey,
	validation: Validation,
}

impl TokenVerifier {
	pub fn from_public_key_pem(pem: &[u8]) -> anyhow::Result<Self> {
		let decoding = DecodingKey::from_ed_pem(pem).context("parse Ed25519 public key PEM")?;

		let mut validation = Validation::new(Algorithm::EdDSA);
		validation.set_issuer(&[TOKEN_ISSUER]);
		validation.set_audience(&[TOKEN_AUDIENCE]);

		Ok(Self { decoding, validation })
	}

	pub fn from_public_key_path(path: &Path) -> anyhow::Result<Self> {
		let pem = std::fs::read(path).with_context(|| format!("read public key from {}", path.display()))?;
		Self::from_public_key_pem(&pem)
	}

	/// Verify a token and require the `access` kind. Any failure is
	/// UNAUTHORIZED; refresh tokens are rejected here by design.
	pub fn verify_access(&self, token: &str) -> Result<AuthedUser, ChatError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(ChatError::Unauthorized("missing access token".to_string()));
		}

		let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation)
			.map_err(|e| ChatError::Unauthorized(format!("invalid access token: {e}")))?;

		if data.claims.kind != TOKEN_KIND_ACCESS {
			return Err(ChatError::Unauthorized(format!(
				"expected an access token, got kind \"{}\"",
				data.claims.kind
			)));
		}

		let user_id = UserId::new(data.claims.sub)
			.map_err(|_| ChatError::Unauthorized("token subject is empty".to_string()))?;

		Ok(AuthedUser {
			user_id,
			email: data.claims.email,
			email_verified: data.claims.email_verified,
		})
	}
}

/// Token minting, used by dev tooling and tests. Production token issuance
/// lives in the auth service; the chat core only ever verifies.
#[allow(dead_code)]
pub struct TokenSigner {
	encoding: EncodingKey,
}

#[allow(dead_code)]
impl TokenSigner {
	pub fn from_private_key_pem(pem: &[u8]) -> anyhow::Result<Self> {
		let encoding = EncodingKey::from_ed_pem(pem).context("parse Ed25519 private key PEM")?;
		Ok(Self { encoding })
	}

	pub fn issue(&self, user_id: &UserId, email: &str, kind: &str, ttl: Duration) -> anyhow::Result<String> {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::ZERO)
			.as_secs();

		let claims = TokenClaims {
			sub: user_id.to_string(),
			email: email.to_string(),
			email_verified: true,
			kind: kind.to_string(),
			iss: TOKEN_ISSUER.to_string(),
			aud: TOKEN_AUDIENCE.to_string(),
			iat: now,
			exp: now + ttl.as_secs(),
		};

		jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding).context("sign token")
	}

	pub fn issue_access(&self, user_id: &UserId, email: &str, ttl: Duration) -> anyhow::Result<String> {
		self.issue(user_id, email, TOKEN_KIND_ACCESS, ttl)
	}
}

/// Membership questions answered against the durable store. Shared by the
/// socket and REST paths.
#[derive(Clone)]
pub struct AuthOracle {
	store: Arc<dyn ChatStore>,
}

impl AuthOracle {
	pub fn new(store: Arc<dyn ChatStore>) -> Self {
		Self { store }
	}

	pub async fn user_by_id(&self, user_id: &UserId) -> Result<Option<UserRecord>, ChatError> {
		Ok(self.store.user_by_id(user_id).await?)
	}

	pub async fn membership(&self, user_id: &UserId, group_id: &GroupId) -> Result<Option<MembershipView>, ChatError> {
		Ok(self.store.membership(user_id, group_id).await?)
	}

	pub async fn is_member(&self, user_id: &UserId, group_id: &GroupId) -> Result<bool, ChatError> {
		Ok(self.membership(user_id, group_id).await?.is_some())
	}

	/// The group plus the caller's membership in it. `NotFound` when the group
	/// does not exist, `Forbidden` unless the caller is its creator or a
	/// member.
	pub async fn assert_group_access(
		&self,
		user_id: &UserId,
		group_id: &GroupId,
	) -> Result<(GroupRecord, Option<MembershipView>), ChatError> {
		let group = self
			.store
			.group_by_id(group_id)
			.await?
			.ok_or_else(|| ChatError::NotFound(format!("group {group_id} not found")))?;

		let membership = self.membership(user_id, group_id).await?;
		if membership.is_none() && group.creator_id != *user_id {
			return Err(ChatError::Forbidden(format!("not a member of group {group_id}")));
		}

		Ok((group, membership))
	}
}
