//! Users, roles, sessions and the JSON-backed user store.
//!
//! Sessions are opaque server-side tokens with a 30-minute sliding expiry,
//! touched (and bound to the caller IP) on every authenticated request.
//! Two-factor enrollment lives outside this crate; consensus-sensitive
//! operations consult the `SecondFactor` seam only.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::signing::{constant_time_eq, secure_random_token};

/// Sessions expire this long after the last authenticated request.
pub const SESSION_TIMEOUT_SECS: i64 = 30 * 60;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 16;

/// What a user is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May submit consensus requests.
    Requester,
    /// May vote on other users' requests.
    Approver,
    /// May manage users and templates.
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Approver => "approver",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "requester" => Some(Role::Requester),
            "approver" => Some(Role::Approver),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub roles: BTreeSet<Role>,
    pub enabled: bool,
    /// Present once two-factor enrollment (external) has completed.
    #[serde(default)]
    pub totp_secret: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub session_last_seen: i64,
    #[serde(default)]
    pub session_ip: String,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Start a fresh session and return its token.
    pub fn start_session(&mut self) -> String {
        let token = secure_random_token(32);
        self.session_token = Some(token.clone());
        self.session_last_seen = chrono::Utc::now().timestamp();
        token
    }

    /// Slide the session window and re-bind it to the caller IP.
    pub fn touch_session(&mut self, ip: &str) {
        self.session_last_seen = chrono::Utc::now().timestamp();
        self.session_ip = ip.to_string();
    }

    /// Validate a presented session token against this user.
    pub fn session_valid(&self, token: &str, now: i64) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(current) = &self.session_token else {
            return false;
        };
        if current.is_empty() || !constant_time_eq(current, token) {
            return false;
        }
        now - self.session_last_seen <= SESSION_TIMEOUT_SECS
    }

    /// Copy with secrets blanked, for listings.
    pub fn sanitized(&self) -> User {
        let mut user = self.clone();
        user.password_hash = String::new();
        user.session_token = None;
        user.totp_secret = None;
        user
    }
}

/// Hash a password using PBKDF2-SHA256.
/// Returns a string in the format `pbkdf2:100000:<hex_salt>:<hex_hash>`.
pub fn hash_password(password: &str) -> String {
    let iterations = 100_000u32;
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hash = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, iterations, &mut hash)
        .expect("PBKDF2 should not fail");

    format!(
        "pbkdf2:{}:{}:{}",
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// Verify a password against a `pbkdf2:<iterations>:<salt>:<hash>` string.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split(':').collect();
    if parts.len() != 4 || parts[0] != "pbkdf2" {
        return false;
    }
    let Ok(iterations) = parts[1].parse::<u32>() else {
        return false;
    };
    let Ok(salt) = hex::decode(parts[2]) else {
        return false;
    };
    let mut hash = [0u8; 32];
    if pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, iterations, &mut hash).is_err() {
        return false;
    }
    constant_time_eq(&hex::encode(hash), parts[3])
}

/// Verification seam for the (externally provisioned) second factor.
pub trait SecondFactor: Send + Sync {
    fn verify(&self, user: &User, proof: &str) -> bool;
}

/// Default verifier: users without an enrolled secret are exempt; anything
/// else is rejected because this process cannot validate proofs without the
/// provisioning stack.
pub struct DefaultSecondFactor;

impl SecondFactor for DefaultSecondFactor {
    fn verify(&self, user: &User, _proof: &str) -> bool {
        user.totp_secret.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct UserSnapshot {
    users: HashMap<String, User>,
}

/// JSON-file-backed user store, keyed by user id.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
    persist_lock: Mutex<()>,
}

impl UserStore {
    pub async fn open(path: PathBuf) -> Self {
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<UserSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse user store {}: {}", path.display(), e);
                    UserSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => UserSnapshot::default(),
            Err(err) => {
                tracing::warn!("Failed to read user store {}: {}", path.display(), err);
                UserSnapshot::default()
            }
        };
        Self {
            path,
            users: RwLock::new(snapshot.users),
            persist_lock: Mutex::new(()),
        }
    }

    /// Seed a first admin account on an empty store so the instance is
    /// reachable. The generated password is printed once; change it.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        {
            let users = self.users.read().await;
            if !users.is_empty() {
                return Ok(());
            }
        }
        let password = secure_random_token(18);
        let roles = BTreeSet::from([Role::Requester, Role::Approver, Role::Admin]);
        self.create_user("admin", &password, "", roles).await?;
        self.save().await?;
        tracing::warn!("Created initial admin account 'admin' with password '{password}', change it after first login");
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        email: &str,
        roles: BTreeSet<Role>,
    ) -> anyhow::Result<User> {
        let username = username.trim();
        if username.is_empty() {
            anyhow::bail!("username can not be empty");
        }
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == username) {
            anyhow::bail!("username {username} already exists");
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash_password(password),
            roles,
            enabled: true,
            totp_secret: None,
            session_token: None,
            session_last_seen: 0,
            session_ip: String::new(),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    pub async fn by_name(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    pub async fn by_id(&self, id: &str) -> Option<User> {
        self.users.read().await.get(id).cloned()
    }

    pub async fn remove_by_name(&self, username: &str) -> bool {
        let mut users = self.users.write().await;
        let id = users
            .values()
            .find(|u| u.username == username)
            .map(|u| u.id.clone());
        match id {
            Some(id) => users.remove(&id).is_some(),
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Verify credentials. Returns the user only on a full match of an
    /// enabled account; callers must map any failure to one constant
    /// message.
    pub async fn verify_login(&self, username: &str, password: &str) -> Option<User> {
        let user = self.by_name(username).await?;
        if !user.enabled || !verify_password(password, &user.password_hash) {
            return None;
        }
        Some(user)
    }

    /// Start a session for a user and return the token.
    pub async fn start_session(&self, user_id: &str, ip: &str) -> Option<String> {
        let mut users = self.users.write().await;
        let user = users.get_mut(user_id)?;
        let token = user.start_session();
        user.touch_session(ip);
        Some(token)
    }

    /// Resolve an authenticated session: username plus token, sliding the
    /// window and re-binding the IP on success.
    pub async fn session_user(&self, username: &str, token: &str, ip: &str) -> Option<User> {
        let now = chrono::Utc::now().timestamp();
        let mut users = self.users.write().await;
        let user = users.values_mut().find(|u| u.username == username)?;
        if !user.session_valid(token, now) {
            return None;
        }
        user.touch_session(ip);
        Some(user.clone())
    }

    pub async fn set_password(&self, user_id: &str, password: &str) -> bool {
        let mut users = self.users.write().await;
        match users.get_mut(user_id) {
            Some(user) => {
                user.password_hash = hash_password(password);
                true
            }
            None => false,
        }
    }

    pub async fn set_enabled(&self, username: &str, enabled: bool) -> bool {
        let mut users = self.users.write().await;
        match users.values_mut().find(|u| u.username == username) {
            Some(user) => {
                user.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Persist the current snapshot. Call after every mutation.
    pub async fn save(&self) -> anyhow::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = UserSnapshot {
            users: self.users.read().await.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn rewind_session(&self, user_id: &str, by_secs: i64) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(user_id) {
            user.session_last_seen -= by_secs;
        }
    }
}
