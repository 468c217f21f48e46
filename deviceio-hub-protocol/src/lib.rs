//! Deviceio Hub Protocol Implementation
//!
//! This library provides the core of the Deviceio Hub: a long-running TLS
//! gateway that accepts outbound connections from remote devices, keeps each
//! connection open as a multiplexed tunnel, and proxies authenticated HTTP
//! requests from operators to the HTTP server a device exposes inside its
//! tunnel. Devices always dial out to the hub; the hub never dials devices.

pub mod auth;
pub mod device;
pub mod gateway;
pub mod mux;
pub mod proxy;
pub mod store;
pub mod tls;

mod error;

pub use auth::{AuthError, Authenticator, AUTH_SCHEME};
pub use device::DeviceInfo;
pub use gateway::{
    ConnectionRegistry, DeviceConnection, GatewayConfig, GatewayServer, ProxySettings,
};
pub use mux::MuxSession;
pub use store::{
    Change, DeviceCache, DeviceRecord, EntityCache, HubStore, Member, MemberCache, Record, User,
    UserCache,
};

pub use error::{HubError, Result};

/// Header added by the API layer so in-device handlers can reconstruct the
/// external URL they are being served under.
pub const PARENT_PATH_HEADER: &str = "x-deviceio-parent-path";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_scheme_literal() {
        assert_eq!(AUTH_SCHEME, "DEVICEIO-HUB-AUTH");
    }
}
