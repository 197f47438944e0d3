//! Where accepted file bytes go.
//!
//! [`Storage`] is the seam to the object backend. [`upload`] persists one
//! file through it and returns the [`FileHandler`] that the form processor
//! turns into replacement fields. [`SavedFiles`] remembers what was stored
//! for a request so a failed or cancelled rewrite leaves nothing behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::context::UploadContext;
use super::error::ProcessingError;

/// Suffixes of the replacement fields written for a stored file.
pub const FIELD_SUFFIXES: [&str; 4] = ["name", "path", "size", "sha256"];

#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist `data` under `key`, returning the reference the backend
    /// will use to find it.
    async fn put(&self, key: &str, data: Bytes) -> Result<String, ProcessingError>;

    async fn delete(&self, reference: &str) -> Result<(), ProcessingError>;
}

/// Result of a successful [`FileAuthorizer`](super::FileAuthorizer) +
/// [`Preparer`](super::Preparer) round: how and where to save one file.
#[derive(Clone)]
pub struct SaveOptions {
    pub storage: Arc<dyn Storage>,
    pub max_size: u64,
}

impl std::fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveOptions")
            .field("storage", &self.storage.name())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandler {
    /// File name as sent by the client.
    pub name: String,
    pub reference: String,
    pub size: u64,
    pub sha256: String,
}

impl FileHandler {
    /// Replacement fields for the form field `prefix`, in a fixed order.
    #[must_use]
    pub fn fields(&self, prefix: &str) -> Vec<(String, String)> {
        let values = [
            self.name.clone(),
            self.reference.clone(),
            self.size.to_string(),
            self.sha256.clone(),
        ];
        FIELD_SUFFIXES
            .iter()
            .zip(values)
            .map(|(suffix, value)| (format!("{prefix}.{suffix}"), value))
            .collect()
    }
}

pub async fn upload(
    ctx: &UploadContext,
    opts: &SaveOptions,
    file_name: &str,
    data: Bytes,
) -> Result<FileHandler, ProcessingError> {
    let size = data.len() as u64;
    let sha256 = format!("{:x}", Sha256::digest(&data));
    let key = uuid::Uuid::new_v4().simple().to_string();

    let reference = ctx.run("store file", opts.storage.put(&key, data)).await?;

    tracing::debug!(
        correlation_id = %ctx.correlation_id,
        storage = opts.storage.name(),
        reference = %reference,
        size,
        "file stored"
    );

    Ok(FileHandler {
        name: file_name.to_string(),
        reference,
        size,
        sha256,
    })
}

/// Files persisted for a single request that are not yet owned by the
/// backend.
///
/// Dropping a non-empty set schedules their deletion on the runtime, so
/// a cancelled request does not leak stored objects.
#[derive(Default)]
pub struct SavedFiles {
    files: Vec<(Arc<dyn Storage>, String)>,
}

impl SavedFiles {
    pub fn push(&mut self, storage: Arc<dyn Storage>, reference: String) {
        self.files.push((storage, reference));
    }

    /// Hand the files over to the backend; nothing is deleted afterwards.
    pub fn commit(mut self) {
        self.files.clear();
    }

    pub async fn rollback(mut self) {
        delete_all(std::mem::take(&mut self.files)).await;
    }
}

impl Drop for SavedFiles {
    fn drop(&mut self) {
        if self.files.is_empty() {
            return;
        }
        let files = std::mem::take(&mut self.files);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(delete_all(files));
            }
            Err(_) => {
                tracing::warn!(count = files.len(), "no runtime to clean up stored files");
            }
        }
    }
}

async fn delete_all(files: Vec<(Arc<dyn Storage>, String)>) {
    for (storage, reference) in files {
        if let Err(e) = storage.delete(&reference).await {
            tracing::warn!(
                storage = storage.name(),
                reference = %reference,
                error = %e,
                "failed to delete stored file"
            );
        }
    }
}

/// Stores files as plain files under a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    timeout: Duration,
}

impl LocalStorage {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<String, ProcessingError> {
        let path = self.root.join(key);
        let write = async {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::write(&path, &data).await
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|e| ProcessingError::unknown("write upload", e))?
            .map_err(|e| ProcessingError::unknown("write upload", e))?;
        Ok(path.display().to_string())
    }

    async fn delete(&self, reference: &str) -> Result<(), ProcessingError> {
        match tokio::fs::remove_file(reference).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProcessingError::unknown("delete upload", e)),
        }
    }
}
