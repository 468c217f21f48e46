//! External API surface
//!
//! The authenticated HTTP routes through which operators reach devices.
//! Every proxied call is validated by the authenticator first; failures are
//! a bare 403 with the reason logged server-side only. Device routes accept
//! either the device UUID or its hostname.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Request as HttpRequest, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use deviceio_hub_protocol::{Authenticator, GatewayServer, HubError, PARENT_PATH_HEADER};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

type Request = HttpRequest<Body>;

/// Remote peer address of the API connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Shared state behind the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<GatewayServer>,
    pub authenticator: Authenticator,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/status", get(get_status))
        .route("/device", get(get_devices))
        .route("/device/{deviceid}", any(proxy_device_root))
        .route("/device/{deviceid}/{*path}", any(proxy_device_path))
        .with_state(state)
}

async fn get_status() -> &'static str {
    "OK"
}

/// List the devices currently connected to this hub's gateway.
async fn get_devices(State(state): State<ApiState>, req: Request) -> Response {
    if let Err(reason) = state.authenticator.authenticate(&auth_snapshot(&req)).await {
        return forbidden(&req, reason);
    }

    let devices = state.gateway.registry().connected_devices().await;
    Json(devices).into_response()
}

/// `/device/{deviceid}`: proxies to the device's root path.
async fn proxy_device_root(
    State(state): State<ApiState>,
    Path(deviceid): Path<String>,
    req: Request,
) -> Response {
    proxy_device(state, deviceid, String::new(), req).await
}

/// `/device/{deviceid}/{path...}`: proxies the trailing path.
async fn proxy_device_path(
    State(state): State<ApiState>,
    Path((deviceid, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy_device(state, deviceid, path, req).await
}

async fn proxy_device(
    state: ApiState,
    deviceid: String,
    path: String,
    mut req: Request,
) -> Response {
    if let Err(reason) = state.authenticator.authenticate(&auth_snapshot(&req)).await {
        return forbidden(&req, reason);
    }

    // Let in-device handlers reconstruct the external URL they live under.
    if let Ok(parent) = HeaderValue::from_str(&format!("/device/{deviceid}")) {
        req.headers_mut().insert(PARENT_PATH_HEADER, parent);
    }

    match state.gateway.proxy_http_request(&deviceid, &path, req).await {
        Ok(response) => response.map(Body::new),
        Err(e @ HubError::DeviceNotConnected(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ HubError::InvalidArgument(_)) => {
            error!(deviceid = %deviceid, error = %e, "device proxy called incorrectly");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            warn!(deviceid = %deviceid, error = %e, "device proxy failed");
            (StatusCode::BAD_GATEWAY, "device proxy failed").into_response()
        }
    }
}

/// A bodyless copy of `req`'s method/uri/headers for the authenticator.
///
/// `Authenticator::authenticate` is generic over the body type and is
/// awaited here; `axum::body::Body` is not `Sync`, so holding a reference to
/// the real request across that `.await` would make the handler's future
/// non-`Send`. The authenticator never inspects the body, so a lightweight
/// snapshot sidesteps that without touching the original request.
fn auth_snapshot(req: &Request) -> HttpRequest<()> {
    let mut snapshot = HttpRequest::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(())
        .expect("method/uri/version copied from a valid request");
    *snapshot.headers_mut() = req.headers().clone();
    snapshot
}

/// 403 with an empty body; the reason only reaches the log.
fn forbidden<E: std::fmt::Display>(req: &Request, reason: E) -> Response {
    let remote_addr = req.extensions().get::<ClientAddr>().map(|a| a.0);
    error!(
        remote_addr = ?remote_addr,
        authorization = ?req.headers().get(AUTHORIZATION),
        "{reason}"
    );
    StatusCode::FORBIDDEN.into_response()
}

/// Serve the router over TLS. Returns the bound address and the listener
/// task; aborting the task stops the API.
pub async fn serve(
    router: Router,
    bind_addr: SocketAddr,
    tls_config: Arc<tokio_rustls::rustls::ServerConfig>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(tls_config);
    info!(bind_addr = %local_addr, "api starting");

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let acceptor = acceptor.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                debug!(remote_addr = %remote_addr, error = %e, "api TLS handshake failed");
                                return;
                            }
                        };

                        let service = TowerToHyperService::new(router.map_request(
                            move |mut req: HttpRequest<Incoming>| {
                                req.extensions_mut().insert(ClientAddr(remote_addr));
                                req.map(Body::new)
                            },
                        ));

                        if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                            TokioExecutor::new(),
                        )
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                        {
                            debug!(remote_addr = %remote_addr, error = %e, "api connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "error accepting api connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    });

    Ok((local_addr, task))
}
