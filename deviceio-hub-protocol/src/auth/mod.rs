//! API request authentication
//!
//! Operators authenticate each API request with a detached Ed25519 signature
//! over a canonical rendering of the request, peppered with the current TOTP
//! passcode of their account. A captured signature is useless outside its
//! 30-second TOTP window and cannot be replayed against a different method,
//! host, path, query or content type within it.

mod authenticator;
pub mod totp;

pub use authenticator::{Authenticator, AUTH_SCHEME};

use thiserror::Error;

/// Authentication failures.
///
/// Every variant is surfaced to API callers as a bare 403; the message is
/// only ever logged server-side.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header was supplied
    #[error("authentication header empty")]
    HeaderEmpty,

    /// The header did not split into exactly a type and a value
    #[error("authorization header does not contain valid type and value")]
    MalformedHeader,

    /// The header carried a type other than the hub's scheme
    #[error("authorization header <type> must be 'DEVICEIO-HUB-AUTH'")]
    UnsupportedScheme,

    /// The value did not split into exactly a user field and a signature
    #[error("authorization value does not have required format <user_id>:<ed25519_signature_base64>")]
    MalformedValue,

    /// The signature field was not valid standard base64
    #[error("authorization signature is not valid base64")]
    SignatureEncoding,

    /// No cached user matched the supplied id, login or email
    #[error("no such user")]
    NoSuchUser,

    /// The Ed25519 signature did not verify against the canonical message
    #[error("signature mismatch")]
    SignatureMismatch,
}
