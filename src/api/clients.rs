//! Agent-facing endpoints and the operator views over the fleet.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, OriginalUri, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::types::{
    split_tags, ClientPingQuery, ClientsQuery, CommandStateQuery, UploadLogsRequest,
};
use super::{require_agent_auth, require_session, ApiResult};
use crate::server::Server;

/// `GET /client/{id}/ping?tags=a,b` - presence plus tag refresh.
pub async fn client_ping(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(query): Query<ClientPingQuery>,
) -> ApiResult {
    require_agent_auth(&headers, &uri, &server)?;
    let tags = split_tags(query.tags.as_deref().unwrap_or_default());
    server.register_agent(&client_id, tags).await;
    Ok(Json(json!({
        "ack": true,
        "server_instance_id": server.instance_id,
    })))
}

/// `GET /client/{id}/cmds` - long-poll for pending commands.
pub async fn client_cmds(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
) -> ApiResult {
    require_agent_auth(&headers, &uri, &server)?;
    let cmds = server.poll_agent_commands(&client_id).await?;
    Ok(Json(json!({ "cmds": cmds })))
}

/// `PUT /client/{id}/cmd/{cmdId}/state?state=S` - state transition report.
pub async fn put_cmd_state(
    State(server): State<Arc<Server>>,
    Path((client_id, cmd_id)): Path<(String, String)>,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(query): Query<CommandStateQuery>,
) -> ApiResult {
    require_agent_auth(&headers, &uri, &server)?;
    let state = server
        .report_command_state(&client_id, &cmd_id, &query.state)
        .await?;
    Ok(Json(json!({ "state": state.as_str() })))
}

/// `PUT /client/{id}/cmd/{cmdId}/logs` - buffered output upload.
pub async fn put_cmd_logs(
    State(server): State<Arc<Server>>,
    Path((client_id, cmd_id)): Path<(String, String)>,
    uri: OriginalUri,
    headers: HeaderMap,
    Json(body): Json<UploadLogsRequest>,
) -> ApiResult {
    require_agent_auth(&headers, &uri, &server)?;
    server
        .append_command_logs(&client_id, &cmd_id, body.output, body.error)
        .await?;
    Ok(Json(json!({ "ack": true })))
}

/// `POST /client/{id}/auth` - rotate the command-signing token.
pub async fn post_client_auth(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
) -> ApiResult {
    require_agent_auth(&headers, &uri, &server)?;
    let (token, token_signature) = server.rotate_agent_token(&client_id).await?;
    Ok(Json(json!({
        "token": token,
        "token_signature": token_signature,
    })))
}

/// `GET /client/{id}/cmd/{cmdId}/logs` - operator view of buffered output.
pub async fn get_cmd_logs(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((client_id, cmd_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    let (output, error) = server.command_logs(&client_id, &cmd_id).await?;
    Ok(Json(json!({
        "log_output": output,
        "log_error": error,
    })))
}

/// `GET /clients?filter_tags_include=…&filter_tags_exclude=…` - fleet listing.
pub async fn get_clients(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ClientsQuery>,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    let include = split_tags(query.filter_tags_include.as_deref().unwrap_or_default());
    let exclude = split_tags(query.filter_tags_exclude.as_deref().unwrap_or_default());

    let agents = server.registry.list(&include, &exclude).await;
    let mut clients = Vec::with_capacity(agents.len());
    for agent in agents {
        clients.push(agent.info().await);
    }
    Ok(Json(json!({ "clients": clients })))
}

/// `GET /dispatched` - audit view of every agent's command history.
pub async fn get_dispatched(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    let mut rows = Vec::new();
    for (client_id, cmds) in server.registry.list_commands().await {
        for cmd in cmds {
            rows.push(json!({
                "client": client_id,
                "id": cmd.id,
                "template_id": cmd.template_id,
                "request_id": cmd.request_id,
                "requester_id": cmd.requester_id,
                "state": cmd.state().as_str(),
                "created": cmd.created,
            }));
        }
    }
    Ok(Json(json!({ "dispatched": rows })))
}
