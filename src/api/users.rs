//! Login and user administration endpoints.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::types::{
    ChangePasswordRequest, CreateUserRequest, DeleteUserQuery, LoginRequest, LoginResponse,
    UpdateUserRequest,
};
use super::{require_role, require_second_factor, require_session, ApiError, ApiResult};
use crate::server::Server;
use crate::users::{Role, MIN_PASSWORD_LEN};

/// Constant so login failures leak nothing about which factor was wrong.
const LOGIN_FAILED: &str = "Username / password / two-factor combination invalid";

/// `POST /auth` - log in and start a session.
pub async fn post_auth(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = server
        .users
        .verify_login(body.username.trim(), &body.password)
        .await
        .ok_or_else(|| ApiError::unauthorized(LOGIN_FAILED))?;
    if !server.second_factor.verify(&user, body.totp.trim()) {
        return Err(ApiError::unauthorized(LOGIN_FAILED));
    }

    let token = server
        .users
        .start_session(&user.id, &addr.ip().to_string())
        .await
        .ok_or_else(|| ApiError::unauthorized(LOGIN_FAILED))?;
    persist_users(&server).await?;

    Ok(Json(LoginResponse {
        session_token: token,
        user_id: user.id,
        user_roles: user.roles.iter().map(|r| r.as_str().to_string()).collect(),
        two_factor_enabled: user.totp_secret.is_some(),
    }))
}

/// `GET /users` - admin listing with secrets blanked.
pub async fn get_users(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    require_role(&headers, &addr, &server, Role::Admin).await?;
    let users: Vec<_> = server
        .users
        .list()
        .await
        .into_iter()
        .map(|u| u.sanitized())
        .collect();
    Ok(Json(json!({ "users": users })))
}

/// `GET /users/names` - id to username mapping, any session.
pub async fn get_user_names(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    let users: Vec<_> = server
        .users
        .list()
        .await
        .into_iter()
        .map(|u| json!({ "id": u.id, "username": u.username }))
        .collect();
    Ok(Json(json!({ "users": users })))
}

/// `POST /user` - create a user (admin plus second factor).
pub async fn post_user(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateUserRequest>,
) -> ApiResult {
    let admin = require_role(&headers, &addr, &server, Role::Admin).await?;
    require_second_factor(&server, &admin, &body.admin_totp)?;
    check_password_pair(&body.password, &body.password2)?;

    let mut roles = BTreeSet::new();
    for raw in &body.roles {
        let role = Role::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown role '{raw}'")))?;
        roles.insert(role);
    }

    let user = server
        .users
        .create_user(&body.username, &body.password, &body.email, roles)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    persist_users(&server).await?;
    Ok(Json(json!({ "user": user.sanitized(), "saved": true })))
}

/// `PUT /user` - enable or disable an account (admin plus second factor).
pub async fn put_user(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<UpdateUserRequest>,
) -> ApiResult {
    let admin = require_role(&headers, &addr, &server, Role::Admin).await?;
    require_second_factor(&server, &admin, &body.admin_totp)?;

    if !server.users.set_enabled(body.username.trim(), body.enable).await {
        return Err(ApiError::not_found("cannot find user to modify"));
    }
    persist_users(&server).await?;
    Ok(Json(json!({ "changed": true })))
}

/// `DELETE /user?username=…` - remove an account (admin plus second factor).
pub async fn delete_user(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DeleteUserQuery>,
) -> ApiResult {
    let admin = require_role(&headers, &addr, &server, Role::Admin).await?;
    require_second_factor(&server, &admin, &query.admin_totp)?;

    let username = query.username.trim();
    if admin.username == username {
        return Err(ApiError::bad_request(
            "you can not remove yourself; create a new admin account first",
        ));
    }
    if !server.users.remove_by_name(username).await {
        return Err(ApiError::not_found("user not found"));
    }
    persist_users(&server).await?;
    Ok(Json(json!({ "saved": true })))
}

/// `PUT /user/password` - change the caller's own password.
pub async fn put_user_password(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordRequest>,
) -> ApiResult {
    let user = require_session(&headers, &addr, &server).await?;
    check_password_pair(&body.password, &body.password2)?;

    if !server.users.set_password(&user.id, &body.password).await {
        return Err(ApiError::not_found("user not found"));
    }
    persist_users(&server).await?;
    Ok(Json(json!({ "saved": true })))
}

fn check_password_pair(password: &str, confirmation: &str) -> Result<(), ApiError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters, please pick a strong one"
        )));
    }
    if password != confirmation {
        return Err(ApiError::bad_request("please confirm your password"));
    }
    Ok(())
}

async fn persist_users(server: &Server) -> Result<(), ApiError> {
    server.users.save().await.map_err(|e| {
        tracing::error!("Failed to persist user store: {e:#}");
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to persist users",
        )
    })
}
