//! Daemon Configuration
//!
//! Configuration for the Deviceio Hub daemon: the two TLS listeners (API
//! and gateway), proxy tuning, and the backing store. Loaded from a TOML
//! file; every field has a default so an empty file, or no file at all,
//! yields a runnable hub with self-signed certificates.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use deviceio_hub_protocol::{GatewayConfig, ProxySettings};
use serde::{Deserialize, Serialize};

/// Hub daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// External API listener
    #[serde(default)]
    pub api: ApiConfig,

    /// Device gateway listener
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Backing store
    #[serde(default)]
    pub store: StoreConfig,
}

/// API listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address the API server binds to
    #[serde(default = "default_api_bind")]
    pub bind_addr: SocketAddr,

    /// Path to a PEM TLS certificate; leave unset together with the key to
    /// serve a generated self-signed certificate
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,

    /// Path to the matching PEM TLS key
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

/// Gateway listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Address the gateway TLS listener binds to
    #[serde(default = "default_gateway_bind")]
    pub bind_addr: SocketAddr,

    /// Path to a PEM TLS certificate for the gateway listener
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,

    /// Path to the matching PEM TLS key
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,

    /// Per-stream proxy buffer ceiling in bytes
    #[serde(default = "default_proxy_buffer_size")]
    pub proxy_buffer_size: usize,

    /// Device TLS handshake ceiling in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the JSON store document holding users, members and devices
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_api_bind() -> SocketAddr {
    "0.0.0.0:4431".parse().expect("valid default api bind")
}

fn default_gateway_bind() -> SocketAddr {
    "0.0.0.0:8975".parse().expect("valid default gateway bind")
}

fn default_proxy_buffer_size() -> usize {
    250_000
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/deviceio-hub/store.json")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_bind(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_gateway_bind(),
            tls_cert_path: None,
            tls_key_path: None,
            proxy_buffer_size: default_proxy_buffer_size(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; defaults apply when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config file {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }

    /// Gateway server configuration derived from this file.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            bind_addr: self.gateway.bind_addr,
            tls_cert_path: self.gateway.tls_cert_path.clone(),
            tls_key_path: self.gateway.tls_key_path.clone(),
            proxy: ProxySettings {
                buffer_size: self.gateway.proxy_buffer_size,
            },
            handshake_timeout: Duration::from_secs(self.gateway.handshake_timeout_secs),
        }
    }
}
