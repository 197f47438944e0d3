//! Integration tests for the multipart rewrite pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use gatehouse::upload::authorizer::{StaticAuthorizer, StoragePreparer};
use gatehouse::upload::error::BoxError;
use gatehouse::upload::processor::{
    ArtifactsProcessor, AttachmentsProcessor, ImageCleaner, PassthroughCleaner,
    ZipSignatureInspector,
};
use gatehouse::upload::writer::MultipartWriter;
use gatehouse::upload::{
    FileAuthorizer, FileHandler, FilePart, FormFieldProcessor, MultipartClaims, MultipartRewriter,
    ProcessingError, Storage, TrustClaimEncoder, UploadAuthorization, UploadContext, UploadLimits,
    REWRITTEN_FIELDS_HEADER,
};

const SECRET: &[u8] = b"integration-secret-integration-secret";

#[derive(Default)]
struct MemoryStorage {
    files: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
}

impl MemoryStorage {
    fn stored(&self) -> BTreeMap<String, Bytes> {
        self.files.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<String, ProcessingError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let reference = format!("/mem/{key}");
        self.files.lock().unwrap().insert(reference.clone(), data);
        Ok(reference)
    }

    async fn delete(&self, reference: &str) -> Result<(), ProcessingError> {
        self.files.lock().unwrap().remove(reference);
        Ok(())
    }
}

struct SlowAuthorizer;

#[async_trait]
impl FileAuthorizer for SlowAuthorizer {
    async fn authorize_file(
        &self,
        _part: FilePart<'_>,
    ) -> Result<UploadAuthorization, ProcessingError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(UploadAuthorization::default())
    }
}

struct FailingCleaner;

#[async_trait]
impl ImageCleaner for FailingCleaner {
    async fn clean(&self, _data: Bytes) -> Result<Bytes, BoxError> {
        Err("metadata stripper exited with status 1".into())
    }
}

struct Harness {
    rewriter: MultipartRewriter,
    storage: Arc<MemoryStorage>,
    authorizer: Box<dyn FileAuthorizer>,
    preparer: StoragePreparer,
}

impl Harness {
    fn new() -> Self {
        Self::with(UploadLimits::default(), 1024 * 1024)
    }

    fn with(limits: UploadLimits, max_file_size: u64) -> Self {
        let storage = Arc::new(MemoryStorage::default());
        Self {
            rewriter: MultipartRewriter::new(
                TrustClaimEncoder::new(SECRET, TrustClaimEncoder::DEFAULT_TTL),
                limits,
                Duration::from_secs(5),
            ),
            preparer: StoragePreparer::new(storage.clone(), max_file_size),
            storage,
            authorizer: Box::new(StaticAuthorizer::new(None)),
        }
    }

    /// Run `req` through the rewriter. Returns the response and, when the
    /// next handler was reached, what it received.
    async fn run(
        &self,
        req: Request,
        processor: &mut dyn FormFieldProcessor,
    ) -> (Response, Option<(Parts, Bytes)>) {
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let response = self
            .rewriter
            .intercept(
                req,
                move |req| async move {
                    let (parts, body) = req.into_parts();
                    let bytes = body.collect().await.unwrap().to_bytes();
                    *slot.lock().unwrap() = Some((parts, bytes));
                    StatusCode::OK.into_response()
                },
                self.authorizer.as_ref(),
                processor,
                &self.preparer,
            )
            .await;
        let seen = seen.lock().unwrap().take();
        (response, seen)
    }
}

fn attachments() -> AttachmentsProcessor {
    AttachmentsProcessor::new(Arc::new(PassthroughCleaner))
}

fn multipart(build: impl FnOnce(&mut MultipartWriter)) -> Request {
    let mut writer = MultipartWriter::with_boundary("client-boundary");
    build(&mut writer);
    let content_type = writer.content_type();
    let body = writer.finish();
    Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// (name, file name, contents) of every part of a forwarded body.
async fn parse_parts(parts: &Parts, body: Bytes) -> Vec<(String, Option<String>, String)> {
    let content_type = parts.headers[header::CONTENT_TYPE].to_str().unwrap();
    let boundary = multer::parse_boundary(content_type).unwrap();
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut out = Vec::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let text = field.text().await.unwrap();
        out.push((name, file_name, text));
    }
    out
}

fn decode_claims(parts: &Parts) -> MultipartClaims {
    let token = parts.headers[REWRITTEN_FIELDS_HEADER].to_str().unwrap();
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&["gatehouse"]);
    jsonwebtoken::decode::<MultipartClaims>(token, &DecodingKey::from_secret(SECRET), &validation)
        .unwrap()
        .claims
}

#[tokio::test]
async fn non_multipart_passes_through_untouched() {
    let harness = Harness::new();
    let req = Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-custom", "kept")
        .body(Body::from(r#"{"title":"hello"}"#))
        .unwrap();

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let (parts, body) = seen.expect("next handler was not called");
    assert_eq!(&body[..], br#"{"title":"hello"}"#);
    assert_eq!(parts.headers["x-custom"], "kept");
    assert_eq!(parts.headers[header::CONTENT_TYPE], "application/json");
    assert!(parts.headers.get(REWRITTEN_FIELDS_HEADER).is_none());
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unparseable_content_type_passes_through() {
    let harness = Harness::new();
    let req = Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, "text")
        .body(Body::from("hello"))
        .unwrap();

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let (parts, body) = seen.expect("next handler was not called");
    assert_eq!(&body[..], b"hello");
    assert_eq!(parts.headers[header::CONTENT_TYPE], "text");
    assert!(parts.headers.get(REWRITTEN_FIELDS_HEADER).is_none());
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn three_files_are_replaced_by_references() {
    let harness = Harness::new();
    let req = multipart(|w| {
        w.write_field("title", "release notes");
        w.write_part("avatar", Some("me.png"), Some("image/png"), b"png-bytes");
        w.write_part("doc", Some("notes.txt"), Some("text/plain"), b"some notes");
        w.write_part("log", Some("build.log"), None, b"ok");
    });

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let (parts, body) = seen.expect("next handler was not called");

    let declared: usize = parts.headers[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, body.len());
    assert!(parts.headers.get(header::TRANSFER_ENCODING).is_none());
    assert!(!parts.headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .contains("client-boundary"));

    let fields = parse_parts(&parts, body).await;
    assert!(fields.iter().all(|(_, file_name, _)| file_name.is_none()));
    assert!(fields.iter().any(|(n, _, v)| n == "title" && v == "release notes"));
    assert!(!fields.iter().any(|(n, _, _)| n == "avatar"));

    let claims = decode_claims(&parts);
    let keys: Vec<_> = claims.rewritten_fields.keys().map(String::as_str).collect();
    assert_eq!(keys, ["avatar", "doc", "log"]);

    let by_name: BTreeMap<_, _> = fields
        .iter()
        .map(|(n, _, v)| (n.as_str(), v.as_str()))
        .collect();
    for (field, reference) in &claims.rewritten_fields {
        assert_eq!(by_name[format!("{field}.path").as_str()], reference.as_str());
        assert!(by_name.contains_key(format!("{field}.sha256").as_str()));
    }
    assert_eq!(by_name["avatar.name"], "me.png");
    assert_eq!(by_name["doc.size"], "10");

    let stored = harness.storage.stored();
    assert_eq!(stored.len(), 3);
    assert_eq!(&stored[&claims.rewritten_fields["doc"]][..], b"some notes");
}

#[tokio::test]
async fn too_many_files_is_rejected_and_rolled_back() {
    let harness = Harness::with(
        UploadLimits {
            max_files: 10,
            ..UploadLimits::default()
        },
        1024,
    );
    let req = multipart(|w| {
        for i in 0..11 {
            w.write_part(&format!("file{i}"), Some(&format!("f{i}.txt")), None, b"x");
        }
    });

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("too many files uploaded"));
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 10);
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test]
async fn declared_part_size_over_limit_persists_nothing() {
    let harness = Harness::with(UploadLimits::default(), 16);
    let body = "--b\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"big.bin\"\r\n\
        Content-Length: 5000\r\n\
        \r\n\
        tiny\r\n\
        --b--\r\n";
    let req = Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b")
        .body(Body::from(body))
        .unwrap();

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn observed_part_size_over_limit_persists_nothing() {
    let harness = Harness::with(UploadLimits::default(), 16);
    let req = multipart(|w| {
        w.write_part("file", Some("big.bin"), None, &[b'a'; 64]);
    });

    let (response, _) = harness.run(req, &mut attachments()).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn declared_request_size_over_limit_is_rejected_up_front() {
    let harness = Harness::with(
        UploadLimits {
            max_request_size: 32,
            ..UploadLimits::default()
        },
        1024,
    );
    let req = multipart(|w| {
        w.write_field("title", &"x".repeat(100));
    });

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn transform_failure_is_unprocessable() {
    let harness = Harness::new();
    let req = multipart(|w| {
        w.write_part("photo", Some("cat.jpg"), Some("image/jpeg"), b"\xff\xd8\xff");
    });
    let mut processor = AttachmentsProcessor::new(Arc::new(FailingCleaner));

    let (response, seen) = harness.run(req, &mut processor).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_text(response).await, "Failed to process image");
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_authorization_is_a_gateway_timeout() {
    let mut harness = Harness::new();
    harness.authorizer = Box::new(SlowAuthorizer);
    let req = multipart(|w| {
        w.write_part("file", Some("a.txt"), None, b"abc");
    });

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_text(response).await, "deadline exceeded");
}

#[tokio::test]
async fn injected_reference_field_is_rejected() {
    let harness = Harness::new();
    let req = multipart(|w| {
        w.write_part("avatar", Some("me.png"), None, b"png");
        w.write_field("avatar.path", "/etc/passwd");
    });

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 1);
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test]
async fn duplicate_file_field_is_rejected() {
    let harness = Harness::new();
    let req = multipart(|w| {
        w.write_part("avatar", Some("a.png"), None, b"a");
        w.write_part("avatar", Some("b.png"), None, b"b");
    });

    let (response, _) = harness.run(req, &mut attachments()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test]
async fn missing_boundary_is_bad_request() {
    let harness = Harness::new();
    let req = Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, "multipart/form-data")
        .body(Body::from("irrelevant"))
        .unwrap();

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn truncated_body_is_bad_request() {
    let harness = Harness::new();
    let req = Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b")
        .body(Body::from(
            "--b\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nno end",
        ))
        .unwrap();

    let (response, seen) = harness.run(req, &mut attachments()).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn artifacts_accept_a_single_archive() {
    let harness = Harness::new();
    let mut processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
    let req = multipart(|w| {
        w.write_part("file", Some("artifacts.zip"), None, b"PK\x03\x04payload");
        w.write_field("expire_in", "1 week");
    });

    let (response, seen) = harness.run(req, &mut processor).await;
    assert_eq!(response.status(), StatusCode::OK);
    let (parts, _) = seen.expect("next handler was not called");
    let claims = decode_claims(&parts);
    assert_eq!(claims.rewritten_fields.len(), 1);
    assert!(claims.rewritten_fields.contains_key("file"));
}

#[tokio::test]
async fn artifacts_reject_a_second_archive() {
    let harness = Harness::new();
    let mut processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
    let req = multipart(|w| {
        w.write_part("file", Some("a.zip"), None, b"PK\x03\x04a");
        w.write_part("file", Some("b.zip"), None, b"PK\x03\x04b");
    });

    let (response, seen) = harness.run(req, &mut processor).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_text(response).await,
        "too many files uploaded (limit 1)"
    );
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 1);
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test]
async fn artifacts_reject_a_file_outside_the_archive_field() {
    let harness = Harness::new();
    let mut processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
    let req = multipart(|w| {
        w.write_part("other", Some("a.zip"), None, b"PK\x03\x04a");
    });

    let (response, seen) = harness.run(req, &mut processor).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // The archive was stored before the field name was refused.
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 1);
    assert!(harness.storage.stored().is_empty());
}

/// Attachments processing that fails once the whole form has been seen.
struct FailingFinalize(AttachmentsProcessor);

#[async_trait]
impl FormFieldProcessor for FailingFinalize {
    async fn process_file(
        &mut self,
        ctx: &UploadContext,
        form_name: &str,
        file: &FileHandler,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        self.0.process_file(ctx, form_name, file, writer).await
    }

    async fn process_field(
        &mut self,
        ctx: &UploadContext,
        form_name: &str,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessingError> {
        self.0.process_field(ctx, form_name, writer).await
    }

    async fn finalize(&mut self, _ctx: &UploadContext) -> Result<(), ProcessingError> {
        Err(ProcessingError::unknown(
            "finalize upload",
            "artifact registry unavailable",
        ))
    }

    fn name(&self) -> &'static str {
        "failing-finalize"
    }

    fn count(&self) -> usize {
        self.0.count()
    }

    async fn transform_contents(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        data: Bytes,
    ) -> Result<Bytes, ProcessingError> {
        self.0.transform_contents(ctx, file_name, data).await
    }
}

#[tokio::test]
async fn finalize_failure_rolls_back_stored_files() {
    let harness = Harness::new();
    let req = multipart(|w| {
        w.write_part("first", Some("a.txt"), None, b"aaa");
        w.write_part("second", Some("b.txt"), None, b"bbb");
        w.write_field("title", "two files");
    });
    let mut processor = FailingFinalize(attachments());

    let (response, seen) = harness.run(req, &mut processor).await;
    assert!(seen.is_none());
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 2);
    assert!(harness.storage.stored().is_empty());
}

#[tokio::test]
async fn artifacts_reject_bad_archive_metadata() {
    let harness = Harness::new();
    let mut processor = ArtifactsProcessor::new(Arc::new(ZipSignatureInspector));
    let req = multipart(|w| {
        w.write_part("file", Some("a.zip"), None, b"definitely not a zip");
    });

    let (response, _) = harness.run(req, &mut processor).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.storage.puts.load(Ordering::SeqCst), 0);
}
