//! HTTP relay plumbing shared by the tunnel client facades
//!
//! A proxied request is forwarded unchanged except for its target (rewritten
//! to the device's in-tunnel server) and the hop-by-hop headers, which are
//! meaningful only for the hop they arrived on (RFC 7230 §6.1).

use http::header::{HeaderMap, HeaderValue, HOST};
use http::uri::{PathAndQuery, Uri};
use http::Request;

use crate::Result;

/// Authority every in-tunnel request is addressed to. The device exposes its
/// HTTP server on an implicit localhost inside the mux session.
pub const TUNNEL_AUTHORITY: &str = "localhost";

/// Standard hop-by-hop headers per RFC 7230, stripped in both directions.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any headers nominated by the
/// `Connection` header itself.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in nominated {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite a request so it addresses the device's in-tunnel HTTP server.
///
/// Only the target moves: scheme `http`, host `localhost`, path
/// `"/" + path` with the original query preserved. Everything else (the
/// method, the remaining headers, the body) is forwarded as-is. Any
/// request-target override from the external hop is discarded wholesale by
/// rebuilding the URI.
pub fn rewrite_for_tunnel<B>(req: &mut Request<B>, path: &str) -> Result<()> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };

    let path_and_query =
        PathAndQuery::try_from(path_and_query.as_str()).map_err(http::Error::from)?;
    let uri = Uri::builder()
        .scheme("http")
        .authority(TUNNEL_AUTHORITY)
        .path_and_query(path_and_query)
        .build()?;

    *req.uri_mut() = uri;
    req.headers_mut()
        .insert(HOST, HeaderValue::from_static(TUNNEL_AUTHORITY));
    strip_hop_by_hop_headers(req.headers_mut());

    Ok(())
}
