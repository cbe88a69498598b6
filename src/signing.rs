//! Signature primitives for the two authentication layers.
//!
//! The coordinator and its agents share one pre-shared secret. Requests from
//! an agent to the coordinator carry a URI signature derived from it; commands
//! travelling the other way carry an independent HMAC keyed by a per-agent
//! rotating token so that a leaked request log cannot be replayed as a
//! command.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("auth token is not valid base64url")]
    MalformedToken,
}

/// Signature for an agent request: `base64url(SHA256(uri ∥ pre-shared token))`.
///
/// Sent in the `X-Auth` header and recomputed by the coordinator for the
/// request URI it actually received.
pub fn uri_signature(uri: &str, preshared_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    hasher.update(preshared_token.as_bytes());
    URL_SAFE.encode(hasher.finalize())
}

/// Signature handed out with a freshly rotated agent token:
/// `base64url(SHA256(token ∥ pre-shared token))`.
///
/// The agent verifies this before trusting the token, so a coordinator
/// imposter without the pre-shared secret cannot plant a key.
pub fn token_signature(token: &str, preshared_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(preshared_token.as_bytes());
    URL_SAFE.encode(hasher.finalize())
}

/// Per-command signature: `base64url(HMAC-SHA256(base64url_decode(token), command ∥ id))`.
///
/// # Errors
///
/// Fails when the auth token does not decode as base64url; the caller treats
/// that the same as a missing signature.
pub fn command_signature(
    auth_token: &str,
    command: &str,
    command_id: &str,
) -> Result<String, SigningError> {
    let key = URL_SAFE
        .decode(auth_token)
        .map_err(|_| SigningError::MalformedToken)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SigningError::MalformedToken)?;
    mac.update(command.as_bytes());
    mac.update(command_id.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Generate `num_bytes` cryptographically random bytes, base64url-encoded.
///
/// Used for rotating agent auth tokens and user session tokens.
pub fn secure_random_token(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// Compare two strings without leaking the mismatch position.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}
