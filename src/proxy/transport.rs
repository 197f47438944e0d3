//! Upstream transport used by the gateway.
//!
//! [`RoundTripper`] is the seam between the gateway and the wire;
//! [`HyperTransport`] is the connection-pooled hyper client used in
//! production. Read failures of the inbound body that mean the peer went
//! away are tagged as [`ClientDisconnected`] before the body reaches the
//! transport, so a failed exchange can later be attributed to the client.
//! Every other read failure passes through untagged.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::upload::error::{chain_any, chain_contains, BoxError};

pub type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;
pub type HttpClient = Client<HttpsConnector, Body>;

#[derive(Debug, thiserror::Error)]
#[error("upstream request failed: {source}")]
pub struct TransportError {
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// True when the exchange failed because the inbound body could not
    /// be read any more, i.e. the client hung up.
    #[must_use]
    pub fn is_client_disconnect(&self) -> bool {
        chain_contains::<ClientDisconnected>(self)
    }

    /// True when the inbound body outgrew the router's body limit.
    #[must_use]
    pub fn is_body_limit(&self) -> bool {
        chain_contains::<http_body_util::LengthLimitError>(self)
    }
}

/// Marker wrapped around read errors of the client's request body.
#[derive(Debug, thiserror::Error)]
#[error("client disconnected: {0}")]
pub struct ClientDisconnected(#[source] pub axum::Error);

/// Tag the read errors of `body` that mean the client hung up as
/// [`ClientDisconnected`].
#[must_use]
pub fn mark_client_body(body: Body) -> Body {
    Body::new(body.map_err(|e| -> BoxError {
        if peer_went_away(&e) {
            Box::new(ClientDisconnected(e))
        } else {
            Box::new(e)
        }
    }))
}

fn peer_went_away(err: &axum::Error) -> bool {
    use std::io::ErrorKind;

    chain_any(err, |e| {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            );
        }
        e.downcast_ref::<hyper::Error>()
            .is_some_and(|h| h.is_incomplete_message() || h.is_canceled())
    })
}

#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: Request) -> Result<Response, TransportError>;
}

#[derive(Clone)]
pub struct HyperTransport {
    client: HttpClient,
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperTransport {
    #[must_use]
    pub fn new() -> Self {
        // When multiple rustls crypto providers are compiled in, rustls cannot
        // auto-detect which one to use. Explicitly install `ring` as the default.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);
        Self { client }
    }
}

#[async_trait]
impl RoundTripper for HyperTransport {
    async fn round_trip(&self, req: Request) -> Result<Response, TransportError> {
        let response = self.client.request(req).await.map_err(TransportError::new)?;
        Ok(response.map(Body::new))
    }
}
