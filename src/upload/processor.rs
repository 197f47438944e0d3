//! Per-upload-kind strategy driven by the multipart rewriter.
//!
//! The rewriter does not know what kind of upload it is handling; it
//! only talks to a [`FormFieldProcessor`]. Two kinds ship with the crate:
//!
//! - [`AttachmentsProcessor`] -- generic file attachments. Images are run
//!   through an [`ImageCleaner`] before they are stored.
//! - [`ArtifactsProcessor`] -- CI artifact archives. Exactly one file in
//!   the `file` field, checked by an [`ArchiveInspector`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::context::UploadContext;
use super::destination::FileHandler;
use super::error::{BoxError, ProcessingError};
use super::writer::MultipartWriter;
use crate::config::model::UploadKind;

#[async_trait]
pub trait FormFieldProcessor: Send + Sync {
    /// Emit the replacement fields for a stored file.
    async fn process_file(
        &mut self,
        ctx: &UploadContext,
        form_name: &str,
        file: &FileHandler,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError>;

    /// Called after a plain field has been copied into `writer`.
    async fn process_field(
        &mut self,
        ctx: &UploadContext,
        form_name: &str,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError>;

    async fn finalize(&mut self, ctx: &UploadContext) -> Result<(), ProcessingError>;

    fn name(&self) -> &'static str;

    fn count(&self) -> usize;

    /// Cap on file parts for this kind of upload, applied on top of the
    /// configured limit.
    fn max_files(&self) -> Option<usize> {
        None
    }

    async fn transform_contents(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        data: Bytes,
    ) -> Result<Bytes, ProcessingError>;
}

/// Removes embedded metadata (EXIF and friends) from an image.
#[async_trait]
pub trait ImageCleaner: Send + Sync {
    async fn clean(&self, data: Bytes) -> Result<Bytes, BoxError>;
}

/// Leaves images untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCleaner;

#[async_trait]
impl ImageCleaner for PassthroughCleaner {
    async fn clean(&self, data: Bytes) -> Result<Bytes, BoxError> {
        Ok(data)
    }
}

/// Validates the metadata of an uploaded archive.
pub trait ArchiveInspector: Send + Sync {
    fn inspect(&self, data: &[u8]) -> Result<(), String>;
}

/// Accepts anything that starts like a ZIP archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipSignatureInspector;

impl ArchiveInspector for ZipSignatureInspector {
    fn inspect(&self, data: &[u8]) -> Result<(), String> {
        const LOCAL_FILE_HEADER: &[u8] = b"PK\x03\x04";
        const EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

        if data.starts_with(LOCAL_FILE_HEADER) || data.starts_with(EMPTY_ARCHIVE) {
            Ok(())
        } else {
            Err("missing zip signature".into())
        }
    }
}

fn is_image(file_name: &str) -> bool {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    matches!(ext.as_deref(), Some("jpg" | "jpeg" | "tiff" | "tif"))
}

fn write_file_fields(form_name: &str, file: &FileHandler, writer: &mut MultipartWriter) {
    for (name, value) in file.fields(form_name) {
        writer.write_field(&name, &value);
    }
}

pub struct AttachmentsProcessor {
    cleaner: Arc<dyn ImageCleaner>,
    count: usize,
}

impl AttachmentsProcessor {
    #[must_use]
    pub fn new(cleaner: Arc<dyn ImageCleaner>) -> Self {
        Self { cleaner, count: 0 }
    }
}

#[async_trait]
impl FormFieldProcessor for AttachmentsProcessor {
    async fn process_file(
        &mut self,
        _ctx: &UploadContext,
        form_name: &str,
        file: &FileHandler,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        write_file_fields(form_name, file, writer);
        self.count += 1;
        Ok(())
    }

    async fn process_field(
        &mut self,
        _ctx: &UploadContext,
        _form_name: &str,
        _writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn finalize(&mut self, ctx: &UploadContext) -> Result<(), ProcessingError> {
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            processor = self.name(),
            files = self.count,
            "multipart form processed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "attachments"
    }

    fn count(&self) -> usize {
        self.count
    }

    async fn transform_contents(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        data: Bytes,
    ) -> Result<Bytes, ProcessingError> {
        if !is_image(file_name) {
            return Ok(data);
        }
        ctx.run("strip image metadata", async {
            self.cleaner
                .clean(data)
                .await
                .map_err(|source| ProcessingError::TransformFailure {
                    filename: file_name.to_string(),
                    source,
                })
        })
        .await
    }
}

pub struct ArtifactsProcessor {
    inspector: Arc<dyn ArchiveInspector>,
    count: usize,
}

impl ArtifactsProcessor {
    pub const FILE_FIELD: &'static str = "file";

    #[must_use]
    pub fn new(inspector: Arc<dyn ArchiveInspector>) -> Self {
        Self {
            inspector,
            count: 0,
        }
    }
}

#[async_trait]
impl FormFieldProcessor for ArtifactsProcessor {
    async fn process_file(
        &mut self,
        _ctx: &UploadContext,
        form_name: &str,
        file: &FileHandler,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        if form_name != Self::FILE_FIELD {
            return Err(ProcessingError::InjectedClientParam {
                field: form_name.to_string(),
            });
        }
        write_file_fields(form_name, file, writer);
        self.count += 1;
        Ok(())
    }

    async fn process_field(
        &mut self,
        _ctx: &UploadContext,
        _form_name: &str,
        _writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn finalize(&mut self, ctx: &UploadContext) -> Result<(), ProcessingError> {
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            processor = self.name(),
            files = self.count,
            "artifact upload processed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "artifacts"
    }

    fn count(&self) -> usize {
        self.count
    }

    fn max_files(&self) -> Option<usize> {
        Some(1)
    }

    async fn transform_contents(
        &self,
        _ctx: &UploadContext,
        _file_name: &str,
        data: Bytes,
    ) -> Result<Bytes, ProcessingError> {
        self.inspector
            .inspect(&data)
            .map_err(|reason| ProcessingError::BadMetadata { reason })?;
        Ok(data)
    }
}

/// Builds a fresh processor for each upload request.
#[derive(Clone)]
pub struct ProcessorFactory {
    cleaner: Arc<dyn ImageCleaner>,
    inspector: Arc<dyn ArchiveInspector>,
}

impl Default for ProcessorFactory {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughCleaner), Arc::new(ZipSignatureInspector))
    }
}

impl ProcessorFactory {
    #[must_use]
    pub fn new(cleaner: Arc<dyn ImageCleaner>, inspector: Arc<dyn ArchiveInspector>) -> Self {
        Self { cleaner, inspector }
    }

    #[must_use]
    pub fn build(&self, kind: UploadKind) -> Box<dyn FormFieldProcessor> {
        match kind {
            UploadKind::Attachments => Box::new(AttachmentsProcessor::new(Arc::clone(&self.cleaner))),
            UploadKind::Artifacts => {
                Box::new(ArtifactsProcessor::new(Arc::clone(&self.inspector)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct BrokenCleaner;

    #[async_trait]
    impl ImageCleaner for BrokenCleaner {
        async fn clean(&self, _data: Bytes) -> Result<Bytes, BoxError> {
            Err("exiftool exited with status 1".into())
        }
    }

    fn ctx() -> UploadContext {
        UploadContext::new("cid", Duration::from_secs(5))
    }

    fn handler() -> FileHandler {
        FileHandler {
            name: "a.zip".into(),
            reference: "/uploads/a".into(),
            size: 4,
            sha256: "00".into(),
        }
    }

    #[test]
    fn image_detection_is_case_insensitive() {
        assert!(is_image("cat.JPG"));
        assert!(is_image("scan.tiff"));
        assert!(!is_image("cat.png"));
        assert!(!is_image("jpg"));
    }

    #[tokio::test]
    async fn cleaner_failure_is_transform_failure() {
        let processor = AttachmentsProcessor::new(Arc::new(BrokenCleaner));
        let err = processor
            .transform_contents(&ctx(), "cat.jpg", Bytes::from_static(b"\xff\xd8"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::TransformFailure { .. }));
    }

    #[tokio::test]
    async fn non_images_skip_the_cleaner() {
        let processor = AttachmentsProcessor::new(Arc::new(BrokenCleaner));
        let data = processor
            .transform_contents(&ctx(), "notes.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(&data[..], b"hi");
    }

    #[tokio::test]
    async fn attachments_write_replacement_fields() {
        let mut processor = AttachmentsProcessor::new(Arc::new(PassthroughCleaner));
        let mut writer = MultipartWriter::with_boundary("b");
        processor
            .process_file(&ctx(), "avatar", &handler(), &mut writer)
            .await
            .unwrap();
        assert_eq!(processor.count(), 1);
        let body = String::from_utf8(writer.finish().to_vec()).unwrap();
        assert!(body.contains("name=\"avatar.path\"\r\n\r\n/uploads/a"));
    }

    #[tokio::test]
    async fn artifacts_reject_bad_archives() {
        let processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
        let err = processor
            .transform_contents(&ctx(), "a.zip", Bytes::from_static(b"not a zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::BadMetadata { .. }));

        let ok = processor
            .transform_contents(&ctx(), "a.zip", Bytes::from_static(b"PK\x05\x06rest"))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn artifacts_accept_one_file_field() {
        let mut processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
        let mut writer = MultipartWriter::new();

        let err = processor
            .process_file(&ctx(), "other", &handler(), &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InjectedClientParam { .. }));

        processor
            .process_file(&ctx(), "file", &handler(), &mut writer)
            .await
            .unwrap();
        assert_eq!(processor.count(), 1);
        assert_eq!(processor.max_files(), Some(1));
        assert_eq!(
            AttachmentsProcessor::new(Arc::new(PassthroughCleaner)).max_files(),
            None
        );
    }

    #[test]
    fn factory_builds_by_kind() {
        let factory = ProcessorFactory::default();
        assert_eq!(factory.build(UploadKind::Attachments).name(), "attachments");
        assert_eq!(factory.build(UploadKind::Artifacts).name(), "artifacts");
    }
}
