//! Approval of individual file parts before their bytes are accepted.
//!
//! A [`FileAuthorizer`] answers "may this file be uploaded, and under
//! which limits"; a [`Preparer`] turns that answer into concrete
//! [`SaveOptions`]. Both are normally backed by the application; the
//! static variants here are what the binary uses when no authorization
//! service is wired in.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Uri};

use super::destination::{SaveOptions, Storage};
use super::error::ProcessingError;

/// The file part being asked about.
#[derive(Debug, Clone, Copy)]
pub struct FilePart<'a> {
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub field_name: &'a str,
    pub file_name: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadAuthorization {
    /// Largest accepted file in bytes; `None` defers to the preparer.
    pub max_size: Option<u64>,
}

#[async_trait]
pub trait FileAuthorizer: Send + Sync {
    async fn authorize_file(
        &self,
        part: FilePart<'_>,
    ) -> Result<UploadAuthorization, ProcessingError>;
}

pub trait Preparer: Send + Sync {
    fn prepare(&self, auth: &UploadAuthorization) -> Result<SaveOptions, ProcessingError>;
}

/// Approves every file part with a fixed size limit.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthorizer {
    max_size: Option<u64>,
}

impl StaticAuthorizer {
    #[must_use]
    pub const fn new(max_size: Option<u64>) -> Self {
        Self { max_size }
    }
}

#[async_trait]
impl FileAuthorizer for StaticAuthorizer {
    async fn authorize_file(
        &self,
        part: FilePart<'_>,
    ) -> Result<UploadAuthorization, ProcessingError> {
        tracing::trace!(field = part.field_name, file = part.file_name, "file part approved");
        Ok(UploadAuthorization {
            max_size: self.max_size,
        })
    }
}

/// Saves every approved file to one storage, capping sizes at a ceiling.
#[derive(Clone)]
pub struct StoragePreparer {
    storage: Arc<dyn Storage>,
    max_size: u64,
}

impl StoragePreparer {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, max_size: u64) -> Self {
        Self { storage, max_size }
    }
}

impl Preparer for StoragePreparer {
    fn prepare(&self, auth: &UploadAuthorization) -> Result<SaveOptions, ProcessingError> {
        let max_size = auth
            .max_size
            .map_or(self.max_size, |limit| limit.min(self.max_size));
        Ok(SaveOptions {
            storage: Arc::clone(&self.storage),
            max_size,
        })
    }
}
