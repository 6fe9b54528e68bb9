//! Keyed-signature creation and verification for the handshake.
//!
//! The signature binds the client's claimed process id and timestamp to the
//! shared secret. Verification is constant-time in the signature comparison,
//! and the timestamp must fall inside an explicit freshness window so a
//! captured signature cannot be replayed later.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::secret::SharedSecret;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew, in either direction, between the client's
/// signed timestamp and the helper's clock.
pub const AUTH_TIMESTAMP_SKEW_SECS: u64 = 300;

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Signs the claimed process id and timestamp with the shared secret.
pub fn sign(pid: u32, timestamp_secs: u64, secret: &SharedSecret) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing_input(pid, timestamp_secs).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Verifies a signature over the claimed process id and timestamp.
/// The comparison is constant-time.
pub fn validate(pid: u32, timestamp_secs: u64, signature: &[u8], secret: &SharedSecret) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(signing_input(pid, timestamp_secs).as_bytes());
    mac.verify_slice(signature).is_ok()
}

/// Whether a signed timestamp is fresh relative to `now_secs`.
pub fn timestamp_within_skew(timestamp_secs: u64, now_secs: u64) -> bool {
    now_secs.abs_diff(timestamp_secs) <= AUTH_TIMESTAMP_SKEW_SECS
}

fn signing_input(pid: u32, timestamp_secs: u64) -> String {
    format!("{pid}.{timestamp_secs}")
}
