//! Gateway server
//!
//! The TLS listener devices dial into. Each accepted connection runs the
//! registration protocol on its own task: TLS handshake (bounded),
//! connection establishment (mux + identity fetch), registry insert, and a
//! disconnect watcher that un-indexes the connection the moment its mux
//! session reports closed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use super::connection::{DeviceConnection, ProxySettings};
use super::registry::ConnectionRegistry;
use crate::{tls, HubError, Result};

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the TLS listener binds to.
    pub bind_addr: SocketAddr,

    /// Path to a PEM certificate; when both TLS paths are absent a
    /// self-signed certificate is generated at startup.
    pub tls_cert_path: Option<PathBuf>,

    /// Path to the matching PEM private key.
    pub tls_key_path: Option<PathBuf>,

    /// Reverse-proxy tuning applied to every device connection.
    pub proxy: ProxySettings,

    /// Ceiling on the TLS handshake of a connecting device.
    pub handshake_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8975".parse().expect("valid default bind addr"),
            tls_cert_path: None,
            tls_key_path: None,
            proxy: ProxySettings::default(),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// The gateway: listener, registration protocol and registry.
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    accept_task: RwLock<Option<JoinHandle<()>>>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            accept_task: RwLock::new(None),
        }
    }

    /// The live connection registry.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the TLS listener and start accepting device connections in the
    /// background. Returns the bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Fails when the TLS material cannot be loaded or the listener cannot
    /// bind; both are fatal to startup.
    pub async fn start(&self) -> Result<SocketAddr> {
        let tls_config = tls::server_config(
            self.config.tls_cert_path.as_deref(),
            self.config.tls_key_path.as_deref(),
        )?;
        let acceptor = TlsAcceptor::from(tls_config);

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "gateway starting");

        let registry = Arc::clone(&self.registry);
        let proxy = self.config.proxy.clone();
        let handshake_timeout = self.config.handshake_timeout;

        let task = tokio::spawn(async move {
            accept_loop(listener, acceptor, registry, proxy, handshake_timeout).await;
        });
        *self.accept_task.write().await = Some(task);

        Ok(local_addr)
    }

    /// Relay an external request to a device's in-tunnel HTTP server.
    ///
    /// `deviceid` may be a device UUID or hostname. Validation failures are
    /// programming errors on the caller's side (`InvalidArgument`); an
    /// unknown device is the ordinary `DeviceNotConnected`.
    pub async fn proxy_http_request<B>(
        &self,
        deviceid: &str,
        path: &str,
        req: Request<B>,
    ) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if deviceid.trim().is_empty() {
            return Err(HubError::invalid_argument("deviceid is empty"));
        }

        let connection = self.registry.find(deviceid).await?;
        connection.proxy_request(req, path).await
    }

    /// Stop accepting and close every registered connection.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.write().await.take() {
            task.abort();
        }
        let closed = self.registry.drain().await;
        info!(connections = closed, "gateway stopped");
    }
}

/// Accept loop: errors are logged and accepting continues after a brief
/// pause so a transient fault (fd exhaustion, conntrack pressure) cannot
/// spin the loop hot.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    proxy: ProxySettings,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                let acceptor = acceptor.clone();
                let registry = Arc::clone(&registry);
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    handle_connection(
                        stream,
                        remote_addr,
                        acceptor,
                        registry,
                        proxy,
                        handshake_timeout,
                    )
                    .await;
                });
            }
            Err(e) => {
                warn!(error = %e, "error accepting gateway connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Run the registration protocol for one accepted TCP connection.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    proxy: ProxySettings,
    handshake_timeout: Duration,
) {
    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!(remote_addr = %remote_addr, error = %e, "device TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(remote_addr = %remote_addr, "device TLS handshake timed out");
            return;
        }
    };

    let connection = match DeviceConnection::establish(tls_stream, remote_addr, proxy).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            warn!(remote_addr = %remote_addr, error = %e, "failed to create gateway connection");
            return;
        }
    };

    match registry.register(Arc::clone(&connection)).await {
        Ok(()) => spawn_disconnect_watcher(registry, connection),
        Err(e) => {
            // Both colliding connections are already closed; nothing to
            // watch.
            warn!(remote_addr = %remote_addr, error = %e, "device registration rejected");
        }
    }
}

/// Un-index the connection as soon as its mux session reports closed. The
/// removal is skipped automatically when the keys have already been won by
/// a newer connection; in-flight proxy streams are not force-closed and
/// observe the session close through their own reads.
fn spawn_disconnect_watcher(registry: Arc<ConnectionRegistry>, connection: Arc<DeviceConnection>) {
    tokio::spawn(async move {
        connection.closed().await;
        info!(
            remote_addr = %connection.remote_addr(),
            id = %connection.info().id,
            hostname = %connection.info().hostname,
            "device disconnected"
        );
        registry.remove_if_current(&connection).await;
    });
}
