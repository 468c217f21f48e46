//! Device gateway
//!
//! Accepts device-originated TLS connections, multiplexes each one, fetches
//! the device's identity, and maintains the live registry through which the
//! API layer reaches devices. See the submodules:
//!
//! - [`connection`]: one registered device tunnel and its HTTP facades
//! - [`registry`]: the id/hostname index of live connections
//! - [`server`]: the TLS listener, registration protocol and disconnect
//!   watcher

pub mod connection;
pub mod registry;
pub mod server;

pub use connection::{DeviceConnection, ProxySettings};
pub use registry::ConnectionRegistry;
pub use server::{GatewayConfig, GatewayServer};
