//! API request and response types.

use serde::{Deserialize, Serialize};

/// Login request for `POST /auth`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Second-factor proof, empty when the account is not enrolled.
    #[serde(default)]
    pub totp: String,
}

/// Successful login response.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub session_token: String,
    pub user_id: String,
    pub user_roles: Vec<String>,
    pub two_factor_enabled: bool,
}

/// Body of `POST /consensus/request`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSubmitRequest {
    pub template: String,
    /// Ordered agent selection snapshot.
    pub clients: Vec<String>,
    pub reason: String,
    #[serde(default)]
    pub totp: String,
}

/// Body of `POST /consensus/approve`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApproveRequest {
    pub id: String,
}

/// Body of `POST /template`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplateRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub included_tags: Vec<String>,
    #[serde(default)]
    pub excluded_tags: Vec<String>,
    pub strategy: String,
    pub min_approvals: u32,
    pub timeout_secs: u64,
}

/// Body of `POST /template/{id}/validation`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateValidationRuleRequest {
    pub text: String,
    pub fatal: bool,
    pub must_contain: bool,
    /// 1 = stdout, 2 = stderr.
    pub stream: u8,
}

/// Body of `POST /user`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub password: String,
    pub password2: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub admin_totp: String,
}

/// Body of `PUT /user`. Only the enabled flag is mutable.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub enable: bool,
    #[serde(default)]
    pub admin_totp: String,
}

/// Query of `DELETE /user`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteUserQuery {
    pub username: String,
    #[serde(default)]
    pub admin_totp: String,
}

/// Body of `PUT /user/password`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub password: String,
    pub password2: String,
}

/// Body of `PUT /client/{id}/cmd/{cmdId}/logs`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadLogsRequest {
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Vec<String>,
}

/// Query of `GET /clients`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientsQuery {
    #[serde(default)]
    pub filter_tags_include: Option<String>,
    #[serde(default)]
    pub filter_tags_exclude: Option<String>,
}

/// Query of `GET /client/{id}/ping`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientPingQuery {
    #[serde(default)]
    pub tags: Option<String>,
}

/// Query of `PUT /client/{id}/cmd/{cmdId}/state`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStateQuery {
    pub state: String,
}

/// Generic `?id=` query.
#[derive(Debug, Clone, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

/// Split a comma-separated filter into clean tags.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
