//! Time-based one-time passcodes (RFC 6238)
//!
//! The passcode is not presented by callers directly; it is mixed into the
//! canonical message they sign, acting as a rolling pepper. The hub computes
//! the passcode for the current 30-second window only, so a signature built
//! against any other window fails verification.
//!
//! The user record stores the raw HMAC key bytes and the algorithm is fixed
//! to HMAC-SHA-1, the RFC 6238 default.

use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;

/// RFC 6238 time step.
pub const STEP_SECONDS: u64 = 30;

/// Passcode length in decimal digits.
pub const DIGITS: u32 = 6;

/// Compute the passcode for the window containing `at`.
pub fn passcode_at(secret: &[u8], at: SystemTime) -> String {
    let unix = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    hotp(secret, unix / STEP_SECONDS)
}

/// Compute the passcode for the current window.
pub fn passcode_now(secret: &[u8]) -> String {
    passcode_at(secret, SystemTime::now())
}

/// HOTP (RFC 4226) with dynamic truncation.
fn hotp(secret: &[u8], counter: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
    let tag = hmac::sign(&key, &counter.to_be_bytes());
    let mac = tag.as_ref();

    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        mac[offset] & 0x7f,
        mac[offset + 1],
        mac[offset + 2],
        mac[offset + 3],
    ]);

    format!("{:01$}", binary % 10u32.pow(DIGITS), DIGITS as usize)
}
