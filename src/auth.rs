//! HMAC-based authentication tokens
//!
//! The relay proves knowledge of a per-user shared secret inside the
//! `AUTH PLAIN` line. Token layout:
//! `base64(username ":" ts ":" base64(HMAC-SHA256(secret, "smtp-tunnel-auth:" username ":" ts)))`

use crate::config::User;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const AUTH_PREFIX: &str = "smtp-tunnel-auth";

/// Accepted clock skew between relay and server, seconds, symmetric
pub const MAX_TOKEN_AGE: u64 = 300;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a token for `username` at the given Unix timestamp
pub fn generate(username: &str, secret: &str, timestamp: u64) -> String {
    let message = format!("{AUTH_PREFIX}:{username}:{timestamp}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(message.as_bytes());
    let mac_b64 = BASE64.encode(mac.finalize().into_bytes());

    let inner = format!("{username}:{timestamp}:{mac_b64}");
    BASE64.encode(inner.as_bytes())
}

/// Generate a token stamped with the current time
pub fn generate_now(username: &str, secret: &str) -> String {
    generate(username, secret, unix_now())
}

/// Verify a token against the user table at the current time
pub fn verify(token: &str, users: &HashMap<String, User>, max_age: u64) -> Option<String> {
    verify_at(token, users, max_age, unix_now())
}

/// Verify a token against the user table as of `now`.
///
/// Returns the authenticated username, or `None` for any malformed token,
/// unknown user, empty secret, stale timestamp, or MAC mismatch.
pub fn verify_at(
    token: &str,
    users: &HashMap<String, User>,
    max_age: u64,
    now: u64,
) -> Option<String> {
    let decoded = BASE64.decode(token.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let parts: Vec<&str> = decoded.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let username = parts[0];
    let timestamp: u64 = parts[1].parse().ok()?;
    if now.abs_diff(timestamp) > max_age {
        return None;
    }

    let user = users.get(username)?;
    if user.secret.is_empty() {
        return None;
    }

    let expected = generate(username, &user.secret, timestamp);
    ring::constant_time::verify_slices_are_equal(expected.as_bytes(), token.as_bytes())
        .ok()
        .map(|_| username.to_string())
}

/// Generate a random alphanumeric shared secret
pub fn generate_secret() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
