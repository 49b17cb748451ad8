#![forbid(unsafe_code)]

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use decidr_domain::{GroupId, MessageId, Role, UserId};
use decidr_protocol::{HistoryQuery, MessagePage, SendMessagePayload, ServerEvent, WireMessage};
use decidr_store::{ChatStore, MembershipView};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::server::auth::AuthedUser;
use crate::server::core::ChatCore;
use crate::server::error::ChatError;
use crate::server::messages::system_message;

/// REST veneer over the same pipelines as the socket path, plus health.
pub fn http_router(core: ChatCore) -> Router {
	let cors = CorsLayer::new()
		.allow_origin(Any)
		.allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
		.allow_headers(Any);

	let api = Router::new()
		.route("/messages", post(post_message))
		.route(
			"/messages/{id}",
			get(get_message).put(update_message).delete(delete_message),
		)
		.route("/{group_id}/messages", get(group_messages))
		.route("/{group_id}/members", get(list_members).post(add_member))
		.route(
			"/{group_id}/members/{user_id}",
			put(change_member_role).delete(remove_member),
		)
		.layer(middleware::from_fn_with_state(core.clone(), require_access_token));

	Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.merge(api)
		.layer(cors)
		.layer(TraceLayer::new_for_http())
		.with_state(core)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(core): State<ChatCore>) -> Response {
	if core.health.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers.get(AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Bearer-token middleware. Shares the gateway's verifier: access kind only,
/// refresh tokens rejected.
async fn require_access_token(
	State(core): State<ChatCore>,
	mut request: Request,
	next: Next,
) -> Result<Response, ChatError> {
	let token = bearer_token(request.headers())
		.ok_or_else(|| ChatError::Unauthorized("missing bearer token".to_string()))?;
	let authed = core.verifier.verify_access(token)?;
	request.extensions_mut().insert(authed);
	Ok(next.run(request).await)
}

fn parse_group(raw: &str) -> Result<GroupId, ChatError> {
	GroupId::new(raw).map_err(|e| ChatError::Validation(e.to_string()))
}

fn parse_message_id(raw: &str) -> Result<MessageId, ChatError> {
	MessageId::new(raw).map_err(|e| ChatError::Validation(e.to_string()))
}

fn parse_user(raw: &str) -> Result<UserId, ChatError> {
	UserId::new(raw).map_err(|e| ChatError::Validation(e.to_string()))
}

/// `POST /messages` — like `send_message`, but the caller does not need to
/// have joined any room.
async fn post_message(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Json(payload): Json<SendMessagePayload>,
) -> Result<Json<WireMessage>, ChatError> {
	let message = core.pipeline.send(&authed.user_id, None, payload).await?;
	Ok(Json(message))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
	limit: Option<u32>,
	cursor: Option<String>,
}

async fn group_messages(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(group_id): Path<String>,
	Query(params): Query<HistoryParams>,
) -> Result<Json<MessagePage>, ChatError> {
	let page = core
		.pipeline
		.history(
			&authed.user_id,
			HistoryQuery {
				group_id,
				limit: params.limit,
				cursor: params.cursor,
			},
		)
		.await?;
	Ok(Json(page))
}

async fn get_message(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(id): Path<String>,
) -> Result<Json<WireMessage>, ChatError> {
	let message_id = parse_message_id(&id)?;
	let message = core.pipeline.get(&authed.user_id, &message_id).await?;
	Ok(Json(message))
}

#[derive(Debug, Deserialize)]
struct UpdateMessageBody {
	content: String,
}

async fn update_message(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(id): Path<String>,
	Json(body): Json<UpdateMessageBody>,
) -> Result<Json<WireMessage>, ChatError> {
	let message_id = parse_message_id(&id)?;
	let message = core.pipeline.update(&authed.user_id, &message_id, &body.content).await?;
	Ok(Json(message))
}

async fn delete_message(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ChatError> {
	let message_id = parse_message_id(&id)?;
	core.pipeline.delete(&authed.user_id, &message_id).await?;
	Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Member row in REST responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberSummary {
	user_id: String,
	name: String,
	email: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	image: Option<String>,
	role: Role,
	joined_at: DateTime<Utc>,
	is_online: bool,
}

impl MemberSummary {
	fn from_view(view: MembershipView, is_online: bool) -> Self {
		Self {
			user_id: view.user.id.to_string(),
			name: view.user.name,
			email: view.user.email,
			image: view.user.image,
			role: view.role,
			joined_at: view.joined_at,
			is_online,
		}
	}
}

async fn list_members(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(group_id): Path<String>,
) -> Result<Json<Vec<MemberSummary>>, ChatError> {
	let group_id = parse_group(&group_id)?;
	core.oracle.assert_group_access(&authed.user_id, &group_id).await?;

	let views = core.store.members_of_group(&group_id).await?;
	let mut members = Vec::with_capacity(views.len());
	for view in views {
		let is_online = core.presence.socket_count(&view.user.id).await > 0;
		members.push(MemberSummary::from_view(view, is_online));
	}
	Ok(Json(members))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberBody {
	user_id: String,
	role: Option<Role>,
}

async fn add_member(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path(group_id): Path<String>,
	Json(body): Json<AddMemberBody>,
) -> Result<Json<MemberSummary>, ChatError> {
	let group_id = parse_group(&group_id)?;
	let target_id = parse_user(&body.user_id)?;
	let role = body.role.unwrap_or(Role::Member);
	if role == Role::Owner {
		return Err(ChatError::Validation(
			"cannot add a member as OWNER; transfer ownership instead".to_string(),
		));
	}

	let actor = core
		.oracle
		.membership(&authed.user_id, &group_id)
		.await?
		.ok_or_else(|| ChatError::Forbidden(format!("not a member of group {group_id}")))?;
	if !actor.role.may_add_member() {
		return Err(ChatError::Forbidden("only owners and admins may add members".to_string()));
	}

	let added = core.store.add_member(&group_id, &target_id, role).await?;
	info!(group = %group_id, user = %target_id, role = %role, "member added");

	// Ephemeral SYSTEM notice; tolerated by every client, persisted nowhere.
	core.rooms
		.broadcast(
			&group_id,
			ServerEvent::MessageReceived(system_message(&group_id, format!("{} joined the group", added.user.name))),
			None,
		)
		.await;

	let is_online = core.presence.socket_count(&target_id).await > 0;
	Ok(Json(MemberSummary::from_view(added, is_online)))
}

async fn remove_member(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path((group_id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ChatError> {
	let group_id = parse_group(&group_id)?;
	let target_id = parse_user(&user_id)?;

	let actor = core
		.oracle
		.membership(&authed.user_id, &group_id)
		.await?
		.ok_or_else(|| ChatError::Forbidden(format!("not a member of group {group_id}")))?;
	let target = core
		.oracle
		.membership(&target_id, &group_id)
		.await?
		.ok_or_else(|| ChatError::NotFound(format!("{target_id} is not a member of {group_id}")))?;

	let removing_self = authed.user_id == target_id;
	if !actor.role.may_remove(target.role, removing_self) {
		return Err(ChatError::Forbidden(format!(
			"{} may not remove a {}",
			actor.role, target.role
		)));
	}

	core.store.remove_member(&group_id, &target_id).await?;
	info!(group = %group_id, user = %target_id, "member removed");

	let notice = if removing_self {
		format!("{} left the group", target.user.name)
	} else {
		format!("{} was removed from the group", target.user.name)
	};
	core.rooms
		.broadcast(
			&group_id,
			ServerEvent::MessageReceived(system_message(&group_id, notice)),
			None,
		)
		.await;

	Ok(Json(serde_json::json!({ "removed": true })))
}

#[derive(Debug, Deserialize)]
struct ChangeRoleBody {
	role: Role,
}

async fn change_member_role(
	State(core): State<ChatCore>,
	Extension(authed): Extension<AuthedUser>,
	Path((group_id, user_id)): Path<(String, String)>,
	Json(body): Json<ChangeRoleBody>,
) -> Result<Json<MemberSummary>, ChatError> {
	let group_id = parse_group(&group_id)?;
	let target_id = parse_user(&user_id)?;

	let actor = core
		.oracle
		.membership(&authed.user_id, &group_id)
		.await?
		.ok_or_else(|| ChatError::Forbidden(format!("not a member of group {group_id}")))?;
	let target = core
		.oracle
		.membership(&target_id, &group_id)
		.await?
		.ok_or_else(|| ChatError::NotFound(format!("{target_id} is not a member of {group_id}")))?;

	if !actor.role.may_change_role(target.role, body.role) {
		return Err(ChatError::Forbidden(format!(
			"{} may not change a {} to {}",
			actor.role, target.role, body.role
		)));
	}

	// Ownership transfer: the old owner steps down to ADMIN first, so the
	// one-owner invariant holds at every point.
	let updated = if body.role == Role::Owner {
		core.store
			.update_member_role(&group_id, &authed.user_id, Role::Admin)
			.await?;
		core.store.update_member_role(&group_id, &target_id, Role::Owner).await?
	} else {
		core.store.update_member_role(&group_id, &target_id, body.role).await?
	};
	info!(group = %group_id, user = %target_id, role = %updated.role, "member role changed");

	let is_online = core.presence.socket_count(&target_id).await > 0;
	Ok(Json(MemberSummary::from_view(updated, is_online)))
}
