//! Failure taxonomy of the multipart rewrite and its HTTP classification.
//!
//! Every way a rewrite can fail ends up as a [`ProcessingError`]. The
//! single place that turns one into a client response is
//! [`ProcessingError::classify`], which is total over the variants and
//! never leaks the wrapped cause to the client.

use std::borrow::Cow;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fixed client message for content transform failures.
pub const TRANSFORM_FAILED_BODY: &str = "Failed to process image";
/// Fixed client message for collaborator timeouts.
pub const DEADLINE_EXCEEDED_BODY: &str = "deadline exceeded";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessingError {
    #[error("request is not multipart")]
    NotMultipart,

    #[error("multipart content type has no boundary")]
    MissingBoundary,

    #[error("malformed multipart body: {0}")]
    MalformedBody(#[source] multer::Error),

    #[error("client sent reserved field name '{field}'")]
    InjectedClientParam { field: String },

    #[error("too many files uploaded (limit {limit})")]
    TooManyFiles { limit: usize },

    #[error("entity is larger than the allowed {limit} bytes")]
    EntityTooLarge { limit: u64 },

    #[error("invalid archive metadata: {reason}")]
    BadMetadata { reason: String },

    #[error("failed to transform contents of '{filename}'")]
    TransformFailure {
        filename: String,
        #[source]
        source: BoxError,
    },

    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("{context}: {source}")]
    Unknown {
        context: &'static str,
        #[source]
        source: BoxError,
    },
}

impl ProcessingError {
    pub fn unknown(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Unknown {
            context,
            source: source.into(),
        }
    }

    /// Map a parser error onto the taxonomy.
    ///
    /// Body read failures caused by the router's body limit count as an
    /// oversized entity; any other read failure is unclassified.
    #[must_use]
    pub fn from_multer(err: multer::Error) -> Self {
        match err {
            multer::Error::NoMultipart => Self::NotMultipart,
            multer::Error::NoBoundary => Self::MissingBoundary,
            multer::Error::FieldSizeExceeded { limit, .. }
            | multer::Error::StreamSizeExceeded { limit } => Self::EntityTooLarge { limit },
            multer::Error::StreamReadFailed(source) => {
                if chain_contains::<http_body_util::LengthLimitError>(&*source) {
                    Self::EntityTooLarge { limit: 0 }
                } else {
                    Self::Unknown {
                        context: "read request body",
                        source,
                    }
                }
            }
            other => Self::MalformedBody(other),
        }
    }

    /// True when the failure is a timeout, either raised by the rewriter
    /// itself or wrapped inside a collaborator error.
    #[must_use]
    pub fn is_deadline(&self) -> bool {
        match self {
            Self::DeadlineExceeded { .. } => true,
            Self::Unknown { source, .. } => {
                chain_contains::<tokio::time::error::Elapsed>(&**source)
                    || chain_any(&**source, |e| {
                        e.downcast_ref::<std::io::Error>()
                            .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
                    })
            }
            _ => false,
        }
    }

    /// HTTP status and client-facing body for this failure.
    ///
    /// Same variant, same answer: nothing here depends on the wrapped
    /// cause except the deadline check.
    #[must_use]
    pub fn classify(&self) -> (StatusCode, Cow<'static, str>) {
        if self.is_deadline() {
            return (
                StatusCode::GATEWAY_TIMEOUT,
                Cow::Borrowed(DEADLINE_EXCEEDED_BODY),
            );
        }
        match self {
            Self::NotMultipart
            | Self::MissingBoundary
            | Self::MalformedBody(_)
            | Self::InjectedClientParam { .. } => canonical(StatusCode::BAD_REQUEST),
            Self::TooManyFiles { .. } => (StatusCode::BAD_REQUEST, Cow::Owned(self.to_string())),
            Self::EntityTooLarge { .. } | Self::BadMetadata { .. } => {
                canonical(StatusCode::PAYLOAD_TOO_LARGE)
            }
            Self::TransformFailure { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Cow::Borrowed(TRANSFORM_FAILED_BODY),
            ),
            Self::DeadlineExceeded { .. } | Self::Unknown { .. } => {
                canonical(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for ProcessingError {
    fn into_response(self) -> Response {
        let (status, body) = self.classify();
        (status, body).into_response()
    }
}

fn canonical(status: StatusCode) -> (StatusCode, Cow<'static, str>) {
    (
        status,
        Cow::Borrowed(status.canonical_reason().unwrap_or("Error")),
    )
}

pub(crate) fn chain_any(
    err: &(dyn std::error::Error + 'static),
    pred: impl Fn(&(dyn std::error::Error + 'static)) -> bool,
) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if pred(e) {
            return true;
        }
        current = e.source();
    }
    false
}

pub(crate) fn chain_contains<T: std::error::Error + 'static>(
    err: &(dyn std::error::Error + 'static),
) -> bool {
    chain_any(err, |e| e.is::<T>())
}
