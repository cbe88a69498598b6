//! HTTP boundary of the coordinator.
//!
//! Two authentication modes coexist. Agent endpoints under `/client/...`
//! require the `X-Auth` header to carry a signature of the request URI under
//! the pre-shared secret. User endpoints require a session: `X-Auth-User`
//! plus `X-Auth-Session`, validated against the user store with a sliding
//! 30-minute window bound to the caller IP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::server::{Server, ServerError};
use crate::signing;
use crate::users::{Role, User};

mod clients;
mod consensus;
mod templates;
pub mod types;
mod users;

/// Uniform JSON error envelope with a meaningful status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::NotFound(_) => ApiError::not_found(err.to_string()),
            ServerError::Invalid(_) | ServerError::Command(_) => {
                ApiError::bad_request(err.to_string())
            }
        }
    }
}

pub type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Verify the URI signature carried by an agent request.
pub fn require_agent_auth(
    headers: &HeaderMap,
    uri: &OriginalUri,
    server: &Server,
) -> Result<(), ApiError> {
    let presented = headers
        .get("x-auth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = signing::uri_signature(&uri.0.to_string(), &server.config.token);
    if !signing::constant_time_eq(presented, &expected) {
        return Err(ApiError::unauthorized("client not authorized"));
    }
    Ok(())
}

/// Resolve the session user from the auth headers, sliding its expiry
/// window and re-binding it to the caller IP.
pub async fn require_session(
    headers: &HeaderMap,
    addr: &SocketAddr,
    server: &Server,
) -> Result<User, ApiError> {
    let username = headers
        .get("x-auth-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = headers
        .get("x-auth-session")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if username.is_empty() || token.is_empty() {
        return Err(ApiError::unauthorized("user not authorized"));
    }
    server
        .users
        .session_user(username, token, &addr.ip().to_string())
        .await
        .ok_or_else(|| ApiError::unauthorized("user not authorized"))
}

/// Session plus role check.
pub async fn require_role(
    headers: &HeaderMap,
    addr: &SocketAddr,
    server: &Server,
    role: Role,
) -> Result<User, ApiError> {
    let user = require_session(headers, addr, server).await?;
    if !user.has_role(role) {
        return Err(ApiError::unauthorized(format!(
            "user not allowed, missing role {role:?}"
        )));
    }
    Ok(user)
}

/// Second-factor gate for consensus-sensitive operations.
pub fn require_second_factor(server: &Server, user: &User, proof: &str) -> Result<(), ApiError> {
    if !server.second_factor.verify(user, proof) {
        return Err(ApiError::unauthorized("invalid two factor token"));
    }
    Ok(())
}

/// Uptime probe, unauthenticated.
async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "ping": "pong" }))
}

/// List the append-only tag catalog.
async fn get_tags(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    Ok(Json(json!({ "tags": server.tags().await })))
}

/// Assemble the coordinator router.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/tags", get(get_tags))
        // Agent endpoints (URI-signature authenticated)
        .route("/client/:client_id/ping", get(clients::client_ping))
        .route("/client/:client_id/cmds", get(clients::client_cmds))
        .route(
            "/client/:client_id/cmd/:cmd_id/state",
            put(clients::put_cmd_state),
        )
        .route(
            "/client/:client_id/cmd/:cmd_id/logs",
            put(clients::put_cmd_logs).get(clients::get_cmd_logs),
        )
        .route("/client/:client_id/auth", post(clients::post_client_auth))
        // User endpoints (session authenticated)
        .route("/auth", post(users::post_auth))
        .route("/clients", get(clients::get_clients))
        .route("/dispatched", get(clients::get_dispatched))
        .route("/templates", get(templates::get_templates))
        .route(
            "/template",
            post(templates::post_template).delete(templates::delete_template),
        )
        .route(
            "/template/:template_id/validation",
            post(templates::post_validation_rule),
        )
        .route(
            "/template/:template_id/validation/:rule_id",
            delete(templates::delete_validation_rule),
        )
        .route(
            "/consensus/request",
            post(consensus::post_request).delete(consensus::delete_request),
        )
        .route("/consensus/approve", post(consensus::post_approve))
        .route("/consensus/pending", get(consensus::get_pending))
        .route("/users", get(users::get_users))
        .route("/users/names", get(users::get_user_names))
        .route(
            "/user",
            post(users::post_user)
                .put(users::put_user)
                .delete(users::delete_user),
        )
        .route("/user/password", put(users::put_user_password))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Bind and serve the coordinator API. Returns only on a fatal listen
/// error; the caller turns that into a non-zero exit.
pub async fn serve(server: Arc<Server>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], server.config.server_port));
    tracing::info!("Starting coordinator at http://{addr}/");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router(server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
