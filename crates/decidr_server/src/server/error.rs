#![forbid(unsafe_code)]

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use decidr_domain::ErrorCode;
use decidr_protocol::ServerEvent;
use decidr_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Expected failure of a chat operation. Handlers turn this into a structured
/// `error` event on the socket path and a JSON error body on the REST path;
/// the session is never closed for one of these.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("{0}")]
	Validation(String),

	#[error("{0}")]
	Unauthorized(String),

	#[error("{0}")]
	Forbidden(String),

	#[error("{0}")]
	NotFound(String),

	#[error("{0}")]
	Conflict(String),

	#[error("internal error")]
	Internal(#[source] anyhow::Error),
}

impl ChatError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ChatError::Validation(_) => ErrorCode::ValidationError,
			ChatError::Unauthorized(_) => ErrorCode::Unauthorized,
			ChatError::Forbidden(_) => ErrorCode::Forbidden,
			ChatError::NotFound(_) => ErrorCode::NotFound,
			ChatError::Conflict(_) => ErrorCode::Conflict,
			ChatError::Internal(_) => ErrorCode::InternalError,
		}
	}

	/// Message safe to put on the wire. Internal causes are logged, not leaked.
	pub fn public_message(&self) -> String {
		match self {
			ChatError::Internal(cause) => {
				error!(error = %cause, "internal error");
				"internal error".to_string()
			}
			other => other.to_string(),
		}
	}

	/// The structured `error` event for the socket path.
	pub fn to_event(&self) -> ServerEvent {
		ServerEvent::Error {
			message: self.public_message(),
			code: self.code(),
		}
	}
}

impl From<StoreError> for ChatError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::NotFound(what) => ChatError::NotFound(format!("{what} not found")),
			StoreError::Conflict(msg) => ChatError::Conflict(msg),
			StoreError::Backend(cause) => ChatError::Internal(cause),
		}
	}
}

impl From<anyhow::Error> for ChatError {
	fn from(err: anyhow::Error) -> Self {
		ChatError::Internal(err)
	}
}

impl IntoResponse for ChatError {
	fn into_response(self) -> Response {
		let status = match &self {
			ChatError::Validation(_) => StatusCode::BAD_REQUEST,
			ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
			ChatError::NotFound(_) => StatusCode::NOT_FOUND,
			ChatError::Conflict(_) => StatusCode::CONFLICT,
			ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};

		let body = serde_json::json!({
			"error": {
				"code": self.code(),
				"message": self.public_message(),
			}
		});

		(status, Json(body)).into_response()
	}
}
