//! Error handling for the hub core
//!
//! This module provides the error type shared by the gateway, proxy and cache
//! layers. Errors from underlying libraries are converted with `thiserror`;
//! authentication has its own error type (`crate::auth::AuthError`) because
//! the API layer maps every one of its variants to a bare 403.

use thiserror::Error;

/// Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors that can occur during hub operations
///
/// Transient per-request errors (`DeviceNotConnected`, proxy dispatch
/// failures) are reported to the API caller as an HTTP status plus a short
/// body. Infrastructure faults (`Tls`, `StoreUnavailable` during startup)
/// are fatal and surface through the daemon's exit status.
#[derive(Error, Debug)]
pub enum HubError {
    /// I/O error (listener, connection, file system)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Self-signed certificate generation error
    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// HTTP transport error on a tunnel stream
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed HTTP request or URI while rewriting for the tunnel
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(#[from] http::Error),

    /// Mux session error reported by the stream multiplexer
    #[error("Mux error: {0}")]
    Mux(#[from] yamux::ConnectionError),

    /// The multiplexer rejected the freshly accepted connection
    #[error("failed to create mux client: {0}")]
    MuxInitFailed(String),

    /// Identity fetch or validation failed during device registration
    #[error("device connect handshake failed: {0}")]
    ConnectHandshakeFailed(String),

    /// A caller passed an empty or nil argument (programming error)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No live connection is registered under the given id or hostname
    #[error("no such device found with id or hostname '{0}'")]
    DeviceNotConnected(String),

    /// Legacy lookup-time collision error. New code rejects colliding
    /// connections at registration time instead; see `ConnectionRegistry`.
    #[error("hostname '{0}' is ambiguous across multiple connections")]
    AmbiguousHostname(String),

    /// Two live connections asserted the same identity; both were closed
    #[error("duplicate device registration for '{0}'")]
    DuplicateRegistration(String),

    /// The backing store could not be reached or its change feed broke
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The mux session is closed; no further streams can be opened
    #[error("mux session closed")]
    SessionClosed,

    /// API request authentication failure
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),
}

impl HubError {
    /// Create an `InvalidArgument` error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        HubError::InvalidArgument(msg.into())
    }

    /// True for faults where retrying the same request may succeed
    /// (the device may reconnect, the store may come back).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::DeviceNotConnected(_)
                | HubError::SessionClosed
                | HubError::StoreUnavailable(_)
                | HubError::Io(_)
                | HubError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HubError::DeviceNotConnected("office-laptop".to_string());
        assert_eq!(
            error.to_string(),
            "no such device found with id or hostname 'office-laptop'"
        );

        let error = HubError::SessionClosed;
        assert_eq!(error.to_string(), "mux session closed");

        let error = HubError::invalid_argument("deviceid is empty");
        assert_eq!(error.to_string(), "invalid argument: deviceid is empty");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::BrokenPipe, "peer went away");
        let hub_error: HubError = io_error.into();

        assert!(matches!(hub_error, HubError::Io(_)));
        assert!(hub_error.is_transient());
    }

    #[test]
    fn test_auth_error_is_transparent() {
        let error: HubError = crate::auth::AuthError::NoSuchUser.into();
        assert_eq!(error.to_string(), "no such user");
        assert!(!error.is_transient());
    }
}
