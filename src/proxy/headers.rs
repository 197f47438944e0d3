//! Header mutations applied by the gateway's built-in directors.
//!
//! Each function here is a single step of the outbound director chain
//! (see [`super::Gateway::new`] for the order). They are plain functions
//! over a request so they can be tested without a transport.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, uri, HeaderMap, HeaderName, HeaderValue, Uri};

pub const VERSION_HEADER: &str = "gatehouse";
pub const PROXY_START_HEADER: &str = "gatehouse-proxy-start";
pub const BUFFERING_HEADER: &str = "x-accel-buffering";

static HOP_BY_HOP: LazyLock<Vec<HeaderName>> = LazyLock::new(|| {
    [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authorization",
        "proxy-authenticate",
    ]
    .iter()
    .filter_map(|name| name.parse::<HeaderName>().ok())
    .collect()
});

/// Host the client addressed, captured before any director runs.
#[derive(Debug, Clone)]
pub struct OriginalHost(pub HeaderValue);

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// Point the request URI at `upstream`, keeping the inbound path and query.
pub fn point_at_upstream(req: &mut Request, upstream: &Uri) {
    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| uri::PathAndQuery::from_static("/"));

    let mut parts = uri::Parts::default();
    parts.scheme = upstream.scheme().cloned();
    parts.authority = upstream.authority().cloned();
    parts.path_and_query = Some(join_paths(upstream.path(), &path_and_query));

    match Uri::from_parts(parts) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => tracing::warn!(upstream = %upstream, error = %e, "could not build upstream uri"),
    }
}

fn join_paths(base: &str, inbound: &uri::PathAndQuery) -> uri::PathAndQuery {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return inbound.clone();
    }
    let joined = format!("{base}{inbound}");
    joined.parse().unwrap_or_else(|_| inbound.clone())
}

/// Append the peer address to `X-Forwarded-For` when it is known.
pub fn append_forwarded_for(req: &mut Request) {
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().copied() else {
        return;
    };
    let client_ip = addr.ip().to_string();
    let xff = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || client_ip.clone(),
            |existing| format!("{existing}, {client_ip}"),
        );
    if let Ok(val) = HeaderValue::from_str(&xff) {
        req.headers_mut().insert("x-forwarded-for", val);
    }
}

pub fn stamp_bookkeeping(req: &mut Request, version: &HeaderValue) {
    let headers = req.headers_mut();
    headers.insert(VERSION_HEADER, version.clone());
    let started = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string();
    if let Ok(val) = HeaderValue::from_str(&started) {
        headers.insert(PROXY_START_HEADER, val);
    }
}

/// Parse configured headers once. Entries that are not valid HTTP are
/// logged and dropped.
#[must_use]
pub fn compile_custom_headers(custom: &BTreeMap<String, String>) -> Vec<(HeaderName, HeaderValue)> {
    custom
        .iter()
        .filter_map(|(key, value)| {
            match (key.parse::<HeaderName>(), HeaderValue::from_str(value)) {
                (Ok(name), Ok(val)) => Some((name, val)),
                _ => {
                    tracing::warn!(header = %key, "invalid custom header name or value, skipping");
                    None
                }
            }
        })
        .collect()
}

pub fn apply_custom_headers(req: &mut Request, compiled: &[(HeaderName, HeaderValue)]) {
    for (name, value) in compiled {
        req.headers_mut().insert(name.clone(), value.clone());
    }
}

/// Tell the upstream which host the client asked for, then address the
/// upstream by its own authority.
pub fn force_target_host(req: &mut Request) {
    if let Some(OriginalHost(host)) = req.extensions().get::<OriginalHost>().cloned() {
        let headers = req.headers_mut();
        headers.insert("x-forwarded-host", host.clone());
        if let Ok(host) = host.to_str() {
            if let Ok(val) = HeaderValue::from_str(&format!("host={host}")) {
                headers.insert(header::FORWARDED, val);
            }
        }
    }

    let authority = req.uri().authority().map(|a| a.as_str().to_string());
    if let Some(authority) = authority {
        if let Ok(val) = HeaderValue::from_str(&authority) {
            req.headers_mut().insert(header::HOST, val);
        }
    }
}

/// Set the buffering advisory on a response.
pub fn apply_buffering(headers: &mut HeaderMap, allow_buffering: bool) {
    if !allow_buffering {
        headers.insert(BUFFERING_HEADER, HeaderValue::from_static("no"));
    } else if !headers.contains_key(BUFFERING_HEADER) {
        headers.insert(BUFFERING_HEADER, HeaderValue::from_static("yes"));
    }
}
