//! API request authenticator
//!
//! Validates the `Authorization: DEVICEIO-HUB-AUTH <user>:<signature>`
//! header carried by every proxied API call against the in-memory user
//! cache. See the module docs for the scheme's replay properties.

use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use http::Request;
use ring::digest;
use ring::signature::{UnparsedPublicKey, ED25519};
use tracing::debug;

use super::{totp, AuthError};
use crate::store::{User, UserCache};

/// The `Authorization` scheme accepted by the hub.
pub const AUTH_SCHEME: &str = "DEVICEIO-HUB-AUTH";

/// Validates API request signatures against the live user cache.
///
/// Until the cache's first hydration completes it is empty and every
/// request fails with `AuthError::NoSuchUser`; the authenticator is
/// fail-closed by construction.
#[derive(Clone)]
pub struct Authenticator {
    users: Arc<UserCache>,
}

impl Authenticator {
    pub fn new(users: Arc<UserCache>) -> Self {
        Self { users }
    }

    /// Authenticate a request against the current TOTP window.
    pub async fn authenticate<B>(&self, req: &Request<B>) -> Result<(), AuthError> {
        self.authenticate_at(req, SystemTime::now()).await
    }

    /// Authenticate a request with the TOTP passcode evaluated at `now`.
    ///
    /// The verification steps, in order:
    /// 1. strict header parse (`<scheme> <user>:<signature-b64>`);
    /// 2. base64-decode the signature;
    /// 3. resolve the user by id, login or email (first match, exact);
    /// 4. rebuild the canonical message with the passcode for `now`;
    /// 5. verify the Ed25519 signature over the message's SHA-512 digest.
    pub async fn authenticate_at<B>(
        &self,
        req: &Request<B>,
        now: SystemTime,
    ) -> Result<(), AuthError> {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if header.is_empty() {
            return Err(AuthError::HeaderEmpty);
        }

        let type_and_value: Vec<&str> = header.split(' ').collect();
        if type_and_value.len() != 2 {
            return Err(AuthError::MalformedHeader);
        }
        if type_and_value[0] != AUTH_SCHEME {
            return Err(AuthError::UnsupportedScheme);
        }

        let fields: Vec<&str> = type_and_value[1].split(':').collect();
        if fields.len() != 2 {
            return Err(AuthError::MalformedValue);
        }
        let user_field = fields[0];
        let signature = BASE64
            .decode(fields[1])
            .map_err(|_| AuthError::SignatureEncoding)?;

        let user = self
            .users
            .find(|u| u.id == user_field || u.login == user_field || u.email == user_field)
            .await
            .ok_or(AuthError::NoSuchUser)?;

        let message = canonical_message(&user, user_field, req, now);
        let hash = digest::digest(&digest::SHA512, message.as_bytes());

        UnparsedPublicKey::new(&ED25519, user.ed25519_public_key.as_slice())
            .verify(hash.as_ref(), &signature)
            .map_err(|_| {
                debug!(user = %user_field, "API signature failed verification");
                AuthError::SignatureMismatch
            })
    }
}

/// The exact byte sequence a caller signs: the supplied user field, the
/// passcode for the window, and the request's method, host, path, raw query
/// and content type, CRLF-joined in that order.
fn canonical_message<B>(user: &User, user_field: &str, req: &Request<B>, now: SystemTime) -> String {
    let passcode = totp::passcode_at(&user.totp_secret, now);

    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
        })
        .unwrap_or("");

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    [
        user_field,
        passcode.as_str(),
        req.method().as_str(),
        host,
        req.uri().path(),
        req.uri().query().unwrap_or(""),
        content_type,
    ]
    .join("\r\n")
}
