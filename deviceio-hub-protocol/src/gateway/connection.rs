//! Device connection
//!
//! One accepted, TLS-terminated device tunnel. The connection owns the mux
//! session and exposes two HTTP facades pointed into it: a plain client for
//! requests the hub itself issues (the identity fetch), and the
//! reverse-proxy facade the API layer uses to relay operator requests.
//! Every request travels on a freshly opened mux stream; responses stream
//! back without buffering, and dropping a response mid-body resets its
//! stream without disturbing the session.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::HOST;
use http::{header, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::device::DeviceInfo;
use crate::mux::MuxSession;
use crate::proxy::{self, rewrite_for_tunnel, TUNNEL_AUTHORITY};
use crate::{HubError, Result};

/// Ceiling on the size of the identity document a device may present.
const MAX_INFO_BYTES: usize = 64 * 1024;

/// Tuning for the reverse-proxy facade.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Per-stream read buffer ceiling in bytes. Bounds per-request heap
    /// churn under many concurrent proxied streams.
    pub buffer_size: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            buffer_size: 250_000,
        }
    }
}

/// A live, identity-checked device tunnel.
///
/// Created by the gateway server once the device's `/info` document has
/// been fetched and validated; destroyed when the mux session closes. The
/// registry holds it for lookup while in-flight proxy tasks may keep their
/// own references; the session outlives neither.
pub struct DeviceConnection {
    info: DeviceInfo,
    remote_addr: SocketAddr,
    session: MuxSession,
    settings: ProxySettings,
}

impl DeviceConnection {
    /// Run the connection handshake on an accepted byte stream that has
    /// already completed TLS: start the mux session, fetch `GET /info`
    /// through it, and validate the identity.
    ///
    /// # Errors
    ///
    /// `MuxInitFailed` when the multiplexer rejects the connection before a
    /// single stream opens; `ConnectHandshakeFailed` when the identity
    /// fetch or its validation fails. The tunnel is torn down on any error.
    pub async fn establish<T>(
        io: T,
        remote_addr: SocketAddr,
        settings: ProxySettings,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = MuxSession::new(io);

        let connection = Self {
            info: DeviceInfo {
                id: String::new(),
                hostname: String::new(),
                architecture: String::new(),
                platform: String::new(),
                tags: Vec::new(),
            },
            remote_addr,
            session,
            settings,
        };

        match connection.fetch_info().await {
            Ok(info) => match info.validate() {
                Ok(()) => Ok(Self { info, ..connection }),
                Err(e) => {
                    connection.close();
                    Err(e)
                }
            },
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    /// The identity the device presented at connection time.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Remote address of the underlying TCP connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Issue an arbitrary request to the device's in-tunnel HTTP server on
    /// a fresh stream. The URI should be origin-form; the `Host` header is
    /// forced to the tunnel authority.
    pub async fn request<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // The wire target is origin-form; any absolute target collapses to
        // its path and query.
        if req.uri().authority().is_some() {
            let target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            *req.uri_mut() = Uri::try_from(target).map_err(http::Error::from)?;
        }
        req.headers_mut()
            .insert(HOST, header::HeaderValue::from_static(TUNNEL_AUTHORITY));

        let stream = self.session.open_stream().await?;
        let io = TokioIo::new(stream.compat());

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .max_buf_size(self.settings.buffer_size)
            .handshake(io)
            .await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "tunnel stream ended");
            }
        });

        Ok(sender.send_request(req).await?)
    }

    /// Relay an external request to the device.
    ///
    /// The target is rewritten to `http://localhost/<path>` (query
    /// preserved), hop-by-hop headers are stripped in both directions, and
    /// the response streams through with its status and remaining headers
    /// intact. Returns once the device has answered with headers; the body
    /// continues streaming on the returned response.
    pub async fn proxy_request<B>(&self, mut req: Request<B>, path: &str) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        rewrite_for_tunnel(&mut req, path)?;
        let mut response = self.request(req).await?;
        proxy::strip_hop_by_hop_headers(response.headers_mut());
        Ok(response)
    }

    /// Close the mux session, transitively closing all sub-streams.
    pub fn close(&self) {
        self.session.close();
    }

    /// Whether the underlying mux session has terminated.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Resolves when the underlying mux session terminates.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    /// Fetch and decode the device identity document.
    async fn fetch_info(&self) -> Result<DeviceInfo> {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/info")
            .body(Empty::<Bytes>::new())
            .map_err(HubError::HttpProtocol)?;

        let response = self.request(req).await.map_err(|e| match e {
            // A session that cannot open its first stream was rejected by
            // the multiplexer, not by the device.
            HubError::Mux(e) => HubError::MuxInitFailed(e.to_string()),
            HubError::SessionClosed => {
                HubError::MuxInitFailed("session closed before first stream".to_string())
            }
            other => HubError::ConnectHandshakeFailed(format!(
                "failed retrieving device info: {other}"
            )),
        })?;

        if !response.status().is_success() {
            return Err(HubError::ConnectHandshakeFailed(format!(
                "device info request returned status {}",
                response.status()
            )));
        }

        let body = Limited::new(response.into_body(), MAX_INFO_BYTES)
            .collect()
            .await
            .map_err(|e| {
                HubError::ConnectHandshakeFailed(format!("failed reading device info: {e}"))
            })?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| {
            HubError::ConnectHandshakeFailed(format!("failed to decode device info: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_support::{connect_pair, device_info, spawn_device, test_addr};
    use http_body_util::Full;

    #[tokio::test]
    async fn test_establish_fetches_identity() {
        let info = device_info("Office-Laptop");
        let (connection, _device) = connect_pair(info.clone()).await.unwrap();

        assert_eq!(connection.info(), &info);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_establish_rejects_invalid_identity() {
        let mut info = device_info("rogue");
        info.id = "not-a-uuid".to_string();

        let (hub_io, device_io) = tokio::io::duplex(256 * 1024);
        let _device = spawn_device(device_io, info);

        let result =
            DeviceConnection::establish(hub_io, test_addr(), ProxySettings::default()).await;
        assert!(matches!(result, Err(HubError::ConnectHandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_establish_fails_without_peer() {
        let (hub_io, device_io) = tokio::io::duplex(256 * 1024);
        drop(device_io);

        let result =
            DeviceConnection::establish(hub_io, test_addr(), ProxySettings::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_proxy_round_trip_preserves_response() {
        let (connection, _device) = connect_pair(device_info("box")).await.unwrap();

        let req = Request::builder()
            .method(Method::GET)
            .uri("https://hub.example.com/device/box/hello")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = connection.proxy_request(req, "hello").await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("x-device-header").unwrap(),
            "device-value"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello from device");
    }

    #[tokio::test]
    async fn test_proxy_forwards_body_query_and_headers() {
        let (connection, _device) = connect_pair(device_info("box")).await.unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("https://hub.example.com/device/box/echo?limit=5")
            .header(header::CONTENT_TYPE, "application/json")
            .header(crate::PARENT_PATH_HEADER, "/device/box")
            .body(Full::new(Bytes::from_static(b"{\"cmd\":\"run\"}")))
            .unwrap();

        let response = connection.proxy_request(req, "echo").await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("x-echoed-parent-path").unwrap(),
            "/device/box"
        );
        assert_eq!(response.headers().get("x-echoed-query").unwrap(), "limit=5");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"cmd\":\"run\"}");
    }

    #[tokio::test]
    async fn test_device_status_passes_through() {
        let (connection, _device) = connect_pair(device_info("box")).await.unwrap();

        let req = Request::builder()
            .uri("/missing")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = connection.proxy_request(req, "missing").await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_close_terminates_session() {
        let (connection, _device) = connect_pair(device_info("box")).await.unwrap();

        connection.close();
        tokio::time::timeout(std::time::Duration::from_secs(2), connection.closed())
            .await
            .expect("connection should close");

        let req = Request::builder()
            .uri("/hello")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(connection.proxy_request(req, "hello").await.is_err());
    }
}
