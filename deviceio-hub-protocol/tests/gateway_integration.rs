//! Gateway integration tests
//!
//! Drives a real `GatewayServer` end to end with in-process device agents:
//! each agent dials the gateway's TLS listener the way a production device
//! does, answers the hub's mux streams with a small HTTP surface, and
//! serves `/info` with whatever identity the test gives it.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use uuid::Uuid;

use deviceio_hub_protocol::{
    DeviceInfo, GatewayConfig, GatewayServer, HubError, ProxySettings,
};

/// Accept any gateway certificate: devices trust the hub out of band, and
/// the default gateway certificate is self-signed.
#[derive(Debug)]
struct TrustAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for TrustAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn device_tls_config() -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnyCert(provider)))
        .with_no_client_auth();
    Arc::new(config)
}

fn device_info(hostname: &str) -> DeviceInfo {
    DeviceInfo {
        id: Uuid::new_v4().to_string(),
        hostname: hostname.to_string(),
        architecture: "amd64".to_string(),
        platform: "linux".to_string(),
        tags: vec!["integration".to_string()],
    }
}

/// Dial the gateway and serve the device's HTTP surface until the hub
/// closes the tunnel or the task is aborted.
fn spawn_device(gateway_addr: SocketAddr, info: DeviceInfo) -> JoinHandle<()> {
    let info = Arc::new(info);
    tokio::spawn(async move {
        let tcp = TcpStream::connect(gateway_addr)
            .await
            .expect("device should reach gateway");
        let connector = TlsConnector::from(device_tls_config());
        let tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .expect("device TLS handshake");

        let mut connection = yamux::Connection::new(
            tls.compat(),
            yamux::Config::default(),
            yamux::Mode::Server,
        );
        futures::future::poll_fn(|cx| loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    let info = info.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle(req, info.clone()));
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream.compat()), service)
                            .await;
                    });
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        })
        .await;
    })
}

async fn handle(
    req: Request<Incoming>,
    info: Arc<DeviceInfo>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/info" => Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(
                serde_json::to_vec(info.as_ref()).unwrap(),
            )))
            .unwrap(),
        "/hello" => Response::builder()
            .header("x-device-header", "device-value")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from_static(b"hello from device")))
            .unwrap(),
        "/echo" => {
            let content_type = req.headers().get(header::CONTENT_TYPE).cloned();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let mut builder = Response::builder();
            if let Some(ct) = content_type {
                builder = builder.header(header::CONTENT_TYPE, ct);
            }
            builder.body(Full::new(body)).unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    };
    Ok(response)
}

async fn start_gateway() -> (GatewayServer, SocketAddr) {
    let config = GatewayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        proxy: ProxySettings::default(),
        ..GatewayConfig::default()
    };
    let server = GatewayServer::new(config);
    let addr = server.start().await.expect("gateway should start");
    (server, addr)
}

/// Poll `check` until it returns true or the deadline passes.
async fn wait_for<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Duration::from_secs(5);
    let result = tokio::time::timeout(deadline, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn wait_until_registered(server: &GatewayServer, key: &str) {
    let registry = server.registry();
    wait_for("device registration", || {
        let registry = registry.clone();
        let key = key.to_string();
        async move { registry.find(&key).await.is_ok() }
    })
    .await;
}

#[tokio::test]
async fn test_device_registers_and_round_trips() {
    let (server, addr) = start_gateway().await;
    let info = device_info("Build-Box");
    let _device = spawn_device(addr, info.clone());

    wait_until_registered(&server, &info.id).await;

    // Lookup works by id and by lowercased hostname.
    let registry = server.registry();
    assert!(registry.find(&info.id.to_uppercase()).await.is_ok());
    assert!(registry.find("build-box").await.is_ok());

    let req = Request::builder()
        .method("GET")
        .uri("https://hub.local/device/build-box/hello")
        .body(Empty::<Bytes>::new())
        .unwrap();

    let response = server
        .proxy_http_request("build-box", "hello", req)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-device-header").unwrap(),
        "device-value"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello from device");

    server.shutdown().await;
}

#[tokio::test]
async fn test_large_body_streams_byte_exact() {
    let (server, addr) = start_gateway().await;
    let info = device_info("bulk-box");
    let _device = spawn_device(addr, info.clone());
    wait_until_registered(&server, &info.id).await;

    // Larger than both the proxy buffer and the yamux stream window.
    let payload: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
    let req = Request::builder()
        .method("POST")
        .uri("https://hub.local/device/bulk-box/echo")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Full::new(Bytes::from(payload.clone())))
        .unwrap();

    let response = server
        .proxy_http_request(&info.id, "echo", req)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), payload.len());
    assert_eq!(&body[..], &payload[..]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_id_rejects_both_connections() {
    let (server, addr) = start_gateway().await;

    let info = device_info("original-host");
    let first = spawn_device(addr, info.clone());
    wait_until_registered(&server, &info.id).await;

    let mut impostor = device_info("impostor-host");
    impostor.id = info.id.clone();
    let second = spawn_device(addr, impostor);

    // Both ends get closed and the registry keeps neither identity.
    let registry = server.registry();
    wait_for("registry to drop the contested id", || {
        let registry = registry.clone();
        let id = info.id.clone();
        async move { registry.find(&id).await.is_err() }
    })
    .await;
    assert!(registry.find("original-host").await.is_err());
    assert!(registry.find("impostor-host").await.is_err());

    wait_for("both device tunnels to close", || {
        let (a, b) = (first.is_finished(), second.is_finished());
        async move { a && b }
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_watcher_unregisters_device() {
    let (server, addr) = start_gateway().await;
    let info = device_info("flaky-host");
    let device = spawn_device(addr, info.clone());
    wait_until_registered(&server, &info.id).await;

    // Kill the device; its TLS connection drops with it.
    device.abort();

    let registry = server.registry();
    wait_for("watcher to remove both index entries", || {
        let registry = registry.clone();
        let id = info.id.clone();
        async move {
            registry.find(&id).await.is_err() && registry.find("flaky-host").await.is_err()
        }
    })
    .await;

    let req = Request::builder()
        .uri("/hello")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let result = server.proxy_http_request(&info.id, "hello", req).await;
    assert!(matches!(result, Err(HubError::DeviceNotConnected(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_identity_never_registers() {
    let (server, addr) = start_gateway().await;

    let mut info = device_info("bogus-host");
    info.id = "definitely-not-a-uuid".to_string();
    let device = spawn_device(addr, info);

    // The gateway drops the connection after the failed handshake.
    wait_for("rejected device tunnel to close", || {
        let finished = device.is_finished();
        async move { finished }
    })
    .await;
    assert!(server.registry().find("bogus-host").await.is_err());
    assert!(server.registry().is_empty().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_after_disconnect_succeeds() {
    let (server, addr) = start_gateway().await;
    let info = device_info("comeback-host");

    let device = spawn_device(addr, info.clone());
    wait_until_registered(&server, &info.id).await;
    device.abort();

    let registry = server.registry();
    wait_for("stale entries to clear", || {
        let registry = registry.clone();
        let id = info.id.clone();
        async move { registry.find(&id).await.is_err() }
    })
    .await;

    // Same identity connects again once the old entries are gone.
    let _device = spawn_device(addr, info.clone());
    wait_until_registered(&server, &info.id).await;

    server.shutdown().await;
}
