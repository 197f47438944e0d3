//! Multipart upload interception.
//!
//! [`MultipartRewriter::intercept`] sits in front of the gateway for
//! upload routes. A multipart request is rewritten in full (files stored
//! out of band, replaced by reference fields, a signed
//! [`REWRITTEN_FIELDS_HEADER`] attached) before the next handler sees it;
//! anything that goes wrong is classified into a client response and the
//! next handler is never called. Non-multipart requests pass through
//! untouched.
//!
//! Submodules:
//! - [`authorizer`] -- [`FileAuthorizer`] and [`Preparer`] seams.
//! - [`claims`] -- JWT side-channel ([`TrustClaimEncoder`]).
//! - [`context`] -- per-request deadline.
//! - [`destination`] -- [`Storage`] seam and stored-file bookkeeping.
//! - [`error`] -- [`ProcessingError`] and its HTTP classification.
//! - [`processor`] -- [`FormFieldProcessor`] and the built-in upload kinds.
//! - [`rewrite`] -- the part-by-part rewrite loop.
//! - [`writer`] -- multipart encoder for the rewritten body.

pub mod authorizer;
pub mod claims;
pub mod context;
pub mod destination;
pub mod error;
pub mod processor;
pub mod rewrite;
pub mod writer;

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};

pub use authorizer::{FileAuthorizer, FilePart, Preparer, UploadAuthorization};
pub use claims::{MultipartClaims, RewrittenFieldMap, TrustClaimEncoder, REWRITTEN_FIELDS_HEADER};
pub use context::UploadContext;
pub use destination::{FileHandler, SaveOptions, SavedFiles, Storage};
pub use error::ProcessingError;
pub use processor::FormFieldProcessor;
pub use rewrite::UploadLimits;

use rewrite::Collaborators;

pub struct MultipartRewriter {
    encoder: TrustClaimEncoder,
    limits: UploadLimits,
    timeout: Duration,
}

impl MultipartRewriter {
    #[must_use]
    pub const fn new(encoder: TrustClaimEncoder, limits: UploadLimits, timeout: Duration) -> Self {
        Self {
            encoder,
            limits,
            timeout,
        }
    }

    /// Rewrite `req` and hand it to `next`, or answer with a classified
    /// error. Non-multipart requests go to `next` unchanged.
    pub async fn intercept<N, Fut>(
        &self,
        req: Request,
        next: N,
        authorizer: &dyn FileAuthorizer,
        processor: &mut dyn FormFieldProcessor,
        preparer: &dyn Preparer,
    ) -> Response
    where
        N: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if matches!(
            rewrite::boundary(req.headers()),
            Err(ProcessingError::NotMultipart)
        ) {
            return next(req).await;
        }

        let correlation_id = correlation_id(&req);
        let processor_name = processor.name();
        match self
            .rewrite(req, authorizer, processor, preparer)
            .await
        {
            Ok(rewritten) => next(rewritten).await,
            Err(e) => {
                let (status, _) = e.classify();
                if status.is_server_error() {
                    tracing::error!(
                        correlation_id = %correlation_id,
                        processor = processor_name,
                        status = status.as_u16(),
                        error = %e,
                        cause = ?std::error::Error::source(&e),
                        "multipart rewrite failed"
                    );
                } else {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        processor = processor_name,
                        status = status.as_u16(),
                        error = %e,
                        "multipart upload rejected"
                    );
                }
                e.into_response()
            }
        }
    }

    /// Rewrite a multipart request into one whose file parts are replaced
    /// by references, carrying a signed list of the rewritten fields.
    ///
    /// Either the whole body is rewritten or nothing is: on error every
    /// file stored for this request is deleted again.
    pub async fn rewrite(
        &self,
        req: Request,
        authorizer: &dyn FileAuthorizer,
        processor: &mut dyn FormFieldProcessor,
        preparer: &dyn Preparer,
    ) -> Result<Request, ProcessingError> {
        let boundary = rewrite::boundary(req.headers())?;
        if declared_length(&req).is_some_and(|len| len > self.limits.max_request_size) {
            return Err(ProcessingError::EntityTooLarge {
                limit: self.limits.max_request_size,
            });
        }

        let ctx = UploadContext::new(correlation_id(&req), self.timeout);
        let (mut parts, body) = req.into_parts();
        let mut saved = SavedFiles::default();

        let result = async {
            let rewritten = rewrite::rewrite_parts(
                &ctx,
                &parts,
                body,
                boundary,
                self.limits,
                Collaborators {
                    authorizer,
                    processor: &mut *processor,
                    preparer,
                },
                &mut saved,
            )
            .await?;
            processor.finalize(&ctx).await?;
            let token = self.encoder.encode(&rewritten.fields)?;
            Ok::<_, ProcessingError>((rewritten, token))
        }
        .await;

        let (rewritten, token) = match result {
            Ok(ok) => ok,
            Err(e) => {
                saved.rollback().await;
                return Err(e);
            }
        };

        let content_type = rewritten.writer.content_type();
        let body = rewritten.writer.finish();

        let headers = &mut parts.headers;
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .map_err(|e| ProcessingError::unknown("set content type", e))?,
        );
        headers.insert(
            REWRITTEN_FIELDS_HEADER,
            HeaderValue::from_str(&token)
                .map_err(|e| ProcessingError::unknown("attach rewritten fields", e))?,
        );

        saved.commit();
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            processor = processor.name(),
            files = rewritten.fields.len(),
            bytes = body.len(),
            "multipart body rewritten"
        );

        Ok(Request::from_parts(parts, Body::from(body)))
    }
}

fn correlation_id(req: &Request) -> String {
    req.headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from)
}

fn declared_length(req: &Request) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
