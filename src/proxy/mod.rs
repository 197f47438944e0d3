//! Reverse-proxy gateway.
//!
//! [`Gateway`] forwards every request to one upstream after running it
//! through an ordered [`DirectorChain`]. [`forward_handler`] is the Axum
//! fallback in front of it: it matches the request against the route
//! table, sends upload routes through the multipart rewriter and hands
//! everything else straight to [`Gateway::serve`].
//!
//! Submodules handle route matching ([`routing`]), the built-in header
//! directors ([`headers`]), director composition ([`director`]) and the
//! upstream wire ([`transport`]).

pub mod director;
pub mod headers;
pub mod routing;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

pub use director::{Director, DirectorChain};
pub use transport::{HyperTransport, RoundTripper, TransportError};

use crate::server::AppState;
use crate::upload::REWRITTEN_FIELDS_HEADER;
use headers::OriginalHost;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Status used for requests whose client went away mid-flight.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client aborted the request")]
    ClientAborted,
    #[error("request body exceeded the size limit")]
    PayloadTooLarge,
    #[error(transparent)]
    Upstream(#[from] TransportError),
}

/// Everything a [`Gateway`] is built from.
pub struct ProxyConfig {
    upstream: Option<Uri>,
    version: String,
    transport: Arc<dyn RoundTripper>,
    headers: BTreeMap<String, String>,
    force_target_host_header: bool,
    allow_response_buffering: bool,
    directors: Vec<Director>,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(version: impl Into<String>, transport: Arc<dyn RoundTripper>) -> Self {
        Self {
            upstream: None,
            version: version.into(),
            transport,
            headers: BTreeMap::new(),
            force_target_host_header: false,
            allow_response_buffering: true,
            directors: Vec::new(),
        }
    }

    #[must_use]
    pub fn upstream(mut self, upstream: Uri) -> Self {
        self.upstream = Some(upstream);
        self
    }

    #[must_use]
    pub fn custom_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub const fn force_target_host_header(mut self, force: bool) -> Self {
        self.force_target_host_header = force;
        self
    }

    #[must_use]
    pub const fn allow_response_buffering(mut self, allow: bool) -> Self {
        self.allow_response_buffering = allow;
        self
    }

    /// Register a director. Directors run after the built-in ones, in the
    /// order they were added.
    #[must_use]
    pub fn director<F>(mut self, director: F) -> Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.directors.push(Box::new(director));
        self
    }
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
    pub client_aborted: AtomicU64,
}

pub struct Gateway {
    upstream: Uri,
    transport: Arc<dyn RoundTripper>,
    directors: DirectorChain,
    allow_response_buffering: bool,
    stats: GatewayStats,
}

impl Gateway {
    /// Build the gateway and its director chain.
    ///
    /// Directors run in this order: upstream addressing and hop-by-hop
    /// stripping, bookkeeping headers, custom headers (sorted by name),
    /// user directors, and finally the host override when enabled.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        let upstream = config
            .upstream
            .unwrap_or_else(|| Uri::from_static("http://localhost"));
        let version = HeaderValue::from_str(&config.version).unwrap_or_else(|e| {
            tracing::warn!(version = %config.version, error = %e, "version is not a valid header value");
            HeaderValue::from_static(env!("CARGO_PKG_VERSION"))
        });
        let custom = headers::compile_custom_headers(&config.headers);

        let mut directors = DirectorChain::new();
        let base = upstream.clone();
        directors.push(move |req| {
            headers::point_at_upstream(req, &base);
            headers::strip_hop_by_hop(req.headers_mut());
            headers::append_forwarded_for(req);
        });
        directors.push(move |req| headers::stamp_bookkeeping(req, &version));
        if !custom.is_empty() {
            directors.push(move |req| headers::apply_custom_headers(req, &custom));
        }
        for director in config.directors {
            directors.push_boxed(director);
        }
        if config.force_target_host_header {
            directors.push(headers::force_target_host);
        }

        Self {
            upstream,
            transport: config.transport,
            directors,
            allow_response_buffering: config.allow_response_buffering,
            stats: GatewayStats::default(),
        }
    }

    #[must_use]
    pub const fn upstream(&self) -> &Uri {
        &self.upstream
    }

    #[must_use]
    pub const fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Send `req` upstream and return its response.
    ///
    /// A transport failure caused by the client body breaking off is
    /// reported as [`ForwardError::ClientAborted`]; one caused by the body
    /// limit as [`ForwardError::PayloadTooLarge`].
    pub async fn forward(&self, mut req: Request) -> Result<Response, ForwardError> {
        if let Some(host) = req.headers().get(axum::http::header::HOST).cloned() {
            req.extensions_mut().insert(OriginalHost(host));
        }
        let mut req = req.map(transport::mark_client_body);
        self.directors.direct(&mut req);

        let mut response = self.transport.round_trip(req).await.map_err(|e| {
            if e.is_client_disconnect() {
                ForwardError::ClientAborted
            } else if e.is_body_limit() {
                ForwardError::PayloadTooLarge
            } else {
                ForwardError::Upstream(e)
            }
        })?;

        headers::strip_hop_by_hop(response.headers_mut());
        headers::apply_buffering(response.headers_mut(), self.allow_response_buffering);
        Ok(response)
    }

    /// Forward `req` and turn any failure into a response.
    pub async fn serve(&self, req: Request) -> Response {
        let correlation_id = req
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let result = self.forward(req).await;
        self.settle(&correlation_id, result)
    }

    fn settle(&self, correlation_id: &str, result: Result<Response, ForwardError>) -> Response {
        match result {
            Ok(response) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                response
            }
            Err(ForwardError::ClientAborted) => {
                self.stats.client_aborted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(correlation_id = %correlation_id, "client closed the request");
                client_closed_request()
            }
            Err(ForwardError::PayloadTooLarge) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(correlation_id = %correlation_id, "request body exceeded the size limit");
                StatusCode::PAYLOAD_TOO_LARGE.into_response()
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    correlation_id = %correlation_id,
                    upstream = %self.upstream,
                    error = %e,
                    "forwarding failed"
                );
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

fn client_closed_request() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() =
        StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST);
    response
}

pub async fn forward_handler(State(state): State<Arc<AppState>>, mut req: Request) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);
    if let Ok(val) = HeaderValue::from_str(&correlation_id) {
        req.headers_mut().insert(CORRELATION_HEADER, val);
    }
    // Only the rewriter may set this header.
    if req.headers_mut().remove(REWRITTEN_FIELDS_HEADER).is_some() {
        tracing::warn!(correlation_id = %correlation_id, "dropped client-supplied rewritten fields header");
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let routes = &state.config.config.routes;
    let upload = routing::match_route(routes, &path, method.as_str())
        .and_then(|idx| routes[idx].upload);

    tracing::info!(
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
        upload = ?upload,
        "request received"
    );

    let mut response = match upload {
        Some(kind) => {
            let uploads = &state.uploads;
            let mut processor = uploads.processors.build(kind);
            let reached_upstream = AtomicBool::new(false);
            let reached = &reached_upstream;
            let gateway = &state.gateway;
            let response = uploads
                .rewriter
                .intercept(
                    req,
                    move |req| {
                        reached.store(true, Ordering::Relaxed);
                        gateway.serve(req)
                    },
                    &*uploads.authorizer,
                    processor.as_mut(),
                    &*uploads.preparer,
                )
                .await;
            if reached_upstream.load(Ordering::Relaxed) {
                state.stats.uploads_forwarded.fetch_add(1, Ordering::Relaxed);
            } else {
                state.stats.uploads_rejected.fetch_add(1, Ordering::Relaxed);
            }
            response
        }
        None => state.gateway.serve(req).await,
    };

    if let Ok(val) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, val);
    }
    response
}
