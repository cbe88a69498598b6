//! Template CRUD and validation-rule management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::types::{CreateTemplateRequest, CreateValidationRuleRequest, IdQuery};
use super::{require_role, require_session, ApiError, ApiResult};
use crate::server::Server;
use crate::template::{ExecutionStrategy, Template};
use crate::users::Role;
use crate::validation::ValidationRule;

/// `GET /templates`.
pub async fn get_templates(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    Ok(Json(json!({ "templates": server.templates.list().await })))
}

/// `POST /template` - admin only.
pub async fn post_template(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateRequest>,
) -> ApiResult {
    require_role(&headers, &addr, &server, Role::Admin).await?;

    let strategy = ExecutionStrategy::parse(&body.strategy)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let template = Template::new(
        body.title,
        body.description,
        body.command,
        body.included_tags,
        body.excluded_tags,
        body.min_approvals,
        body.timeout_secs,
        strategy,
    )
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    server.templates.add(template.clone()).await;
    persist_templates(&server).await?;
    Ok(Json(json!({ "template": template, "saved": true })))
}

/// `DELETE /template?id=…` - admin only.
pub async fn delete_template(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult {
    require_role(&headers, &addr, &server, Role::Admin).await?;
    if !server.templates.remove(query.id.trim()).await {
        return Err(ApiError::not_found("template not found"));
    }
    persist_templates(&server).await?;
    Ok(Json(json!({ "saved": true })))
}

/// `POST /template/{id}/validation` - append a validation rule.
///
/// The caller's `fatal`, `must_contain` and `stream` values are
/// authoritative.
pub async fn post_validation_rule(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateValidationRuleRequest>,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;

    let rule = ValidationRule::new(body.text, body.fatal, body.must_contain, body.stream)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    if !server
        .templates
        .add_validation_rule(&template_id, rule.clone())
        .await
    {
        return Err(ApiError::not_found("template not found"));
    }
    persist_templates(&server).await?;
    Ok(Json(json!({ "rule": rule, "saved": true })))
}

/// `DELETE /template/{id}/validation/{ruleId}`.
pub async fn delete_validation_rule(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((template_id, rule_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&headers, &addr, &server).await?;
    if !server
        .templates
        .remove_validation_rule(&template_id, &rule_id)
        .await
    {
        return Err(ApiError::not_found("validation rule not found"));
    }
    persist_templates(&server).await?;
    Ok(Json(json!({ "saved": true })))
}

async fn persist_templates(server: &Server) -> Result<(), ApiError> {
    server.templates.save().await.map_err(|e| {
        tracing::error!("Failed to persist template store: {e:#}");
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to persist templates",
        )
    })
}
