//! Consensus request endpoints: submit, vote, cancel, and the pending view.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::types::{ApproveRequest, ConsensusSubmitRequest, IdQuery};
use super::{require_role, require_second_factor, require_session, ApiError, ApiResult};
use crate::server::Server;
use crate::users::Role;

/// `POST /consensus/request` - propose running a template on a selection.
///
/// The second factor is verified here so a hijacked session alone can not
/// schedule anything.
pub async fn post_request(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ConsensusSubmitRequest>,
) -> ApiResult {
    let user = require_role(&headers, &addr, &server, Role::Requester).await?;
    require_second_factor(&server, &user, &body.totp)?;

    let request = server
        .submit_request(&body.template, body.clients, &user.id, &body.reason)
        .await?;
    Ok(Json(json!({ "request": request })))
}

/// `POST /consensus/approve` - cast a vote.
pub async fn post_approve(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ApproveRequest>,
) -> ApiResult {
    let user = require_role(&headers, &addr, &server, Role::Approver).await?;
    let approved = server.approve_request(body.id.trim(), &user.id).await?;
    Ok(Json(json!({ "approved": approved })))
}

/// `DELETE /consensus/request?id=…` - cancel a request.
///
/// Only the creator or an admin may cancel; cancellation aborts in-flight
/// commands across the fleet.
pub async fn delete_request(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult {
    let user = require_role(&headers, &addr, &server, Role::Requester).await?;

    let id = query.id.trim();
    let request = server
        .consensus
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found("request not found"))?;

    let is_admin = user.has_role(Role::Admin);
    let is_creator = request.requester_id == user.id;
    if !is_admin && !is_creator {
        return Err(ApiError::unauthorized(
            "only the creator or admins can cancel a request",
        ));
    }

    server.abort_request(id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

/// `GET /consensus/pending` - the caller's approval view.
pub async fn get_pending(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    let user = require_session(&headers, &addr, &server).await?;
    let view = server.pending_view(&user.id).await;
    Ok(Json(json!({
        "requests": view.requests,
        "work": view.work,
        "server_instance_id": server.instance_id,
    })))
}
