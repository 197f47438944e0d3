//! Streaming rewrite of a multipart body.
//!
//! Parts are handled strictly in arrival order. Plain fields are copied
//! through; file parts are authorized, size-checked, transformed, stored,
//! and replaced by the processor's reference fields. The caller gets back
//! the sealed writer and the map of rewritten fields, or the first error.

use std::collections::BTreeSet;

use axum::body::Body;
use axum::http::{header, request::Parts};
use bytes::{Bytes, BytesMut};

use super::authorizer::{FileAuthorizer, FilePart, Preparer};
use super::claims::RewrittenFieldMap;
use super::context::UploadContext;
use super::destination::{self, SavedFiles};
use super::error::ProcessingError;
use super::processor::FormFieldProcessor;
use super::writer::MultipartWriter;

/// Upload limits applied to every multipart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_files: usize,
    /// Ceiling for the sum of all part payloads.
    pub max_request_size: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_request_size: 100 * 1024 * 1024,
        }
    }
}

pub struct Collaborators<'a> {
    pub authorizer: &'a dyn FileAuthorizer,
    pub processor: &'a mut dyn FormFieldProcessor,
    pub preparer: &'a dyn Preparer,
}

/// Extract the boundary from a request's content type.
///
/// A missing content type or a non-multipart one is
/// [`ProcessingError::NotMultipart`]; `multipart/*` without a boundary is
/// [`ProcessingError::MissingBoundary`].
pub fn boundary(headers: &axum::http::HeaderMap) -> Result<String, ProcessingError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProcessingError::NotMultipart)?;
    multer::parse_boundary(content_type).map_err(|e| match e {
        // A media type that does not even parse cannot be multipart.
        multer::Error::DecodeContentType(_) => ProcessingError::NotMultipart,
        other => ProcessingError::from_multer(other),
    })
}

pub(crate) struct Rewritten {
    pub writer: MultipartWriter,
    pub fields: RewrittenFieldMap,
}

struct RewriteState {
    writer: MultipartWriter,
    fields: RewrittenFieldMap,
    plain_fields: BTreeSet<String>,
    remaining: u64,
}

impl RewriteState {
    /// A plain field may neither reuse a file field's name nor live in the
    /// `<file field>.` namespace where replacement fields are written.
    fn check_plain_name(&self, name: &str) -> Result<(), ProcessingError> {
        let injected = self.fields.contains_key(name)
            || self
                .fields
                .keys()
                .any(|file_field| in_namespace(name, file_field));
        if injected {
            return Err(ProcessingError::InjectedClientParam {
                field: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_file_name(&self, name: &str) -> Result<(), ProcessingError> {
        let injected = self.fields.contains_key(name)
            || self.plain_fields.contains(name)
            || self.plain_fields.iter().any(|plain| in_namespace(plain, name));
        if injected {
            return Err(ProcessingError::InjectedClientParam {
                field: name.to_string(),
            });
        }
        Ok(())
    }
}

fn in_namespace(name: &str, file_field: &str) -> bool {
    name.strip_prefix(file_field)
        .is_some_and(|rest| rest.starts_with('.'))
}

pub(crate) async fn rewrite_parts(
    ctx: &UploadContext,
    parts: &Parts,
    body: Body,
    boundary: String,
    limits: UploadLimits,
    collab: Collaborators<'_>,
    saved: &mut SavedFiles,
) -> Result<Rewritten, ProcessingError> {
    let Collaborators {
        authorizer,
        processor,
        preparer,
    } = collab;

    let mut multipart = multer::Multipart::new(body.into_data_stream(), boundary);
    let mut state = RewriteState {
        writer: MultipartWriter::new(),
        fields: RewrittenFieldMap::new(),
        plain_fields: BTreeSet::new(),
        remaining: limits.max_request_size,
    };
    let max_files = processor
        .max_files()
        .map_or(limits.max_files, |cap| cap.min(limits.max_files));

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(ProcessingError::from_multer)?
    {
        let Some(name) = field.name().map(str::to_string) else {
            tracing::debug!(correlation_id = %ctx.correlation_id, "skipping part without a name");
            continue;
        };
        let file_name = field
            .file_name()
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        let content_type = field.content_type().map(ToString::to_string);
        let declared = declared_size(field.headers());

        match file_name {
            None => {
                state.check_plain_name(&name)?;
                check_declared(declared, state.remaining)?;
                let data = read_limited(&mut field, state.remaining).await?;
                state.remaining -= data.len() as u64;

                state
                    .writer
                    .write_part(&name, None, content_type.as_deref(), &data);
                processor
                    .process_field(ctx, &name, &mut state.writer)
                    .await?;
                state.plain_fields.insert(name);
            }
            Some(file_name) => {
                if state.fields.len() >= max_files {
                    return Err(ProcessingError::TooManyFiles { limit: max_files });
                }
                state.check_file_name(&name)?;

                let auth = ctx
                    .run(
                        "authorize file",
                        authorizer.authorize_file(FilePart {
                            uri: &parts.uri,
                            headers: &parts.headers,
                            field_name: &name,
                            file_name: &file_name,
                        }),
                    )
                    .await?;
                let opts = preparer.prepare(&auth)?;

                let limit = opts.max_size.min(state.remaining);
                check_declared(declared, limit)?;
                let data = read_limited(&mut field, limit).await?;
                state.remaining -= data.len() as u64;

                let data = processor.transform_contents(ctx, &file_name, data).await?;
                let handler = destination::upload(ctx, &opts, &file_name, data).await?;
                saved.push(opts.storage.clone(), handler.reference.clone());

                processor
                    .process_file(ctx, &name, &handler, &mut state.writer)
                    .await?;
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    field = %name,
                    size = handler.size,
                    "file part rewritten"
                );
                state.fields.insert(name, handler.reference);
            }
        }
    }

    Ok(Rewritten {
        writer: state.writer,
        fields: state.fields,
    })
}

fn declared_size(headers: &axum::http::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn check_declared(declared: Option<u64>, limit: u64) -> Result<(), ProcessingError> {
    match declared {
        Some(size) if size > limit => Err(ProcessingError::EntityTooLarge { limit }),
        _ => Ok(()),
    }
}

async fn read_limited(
    field: &mut multer::Field<'static>,
    limit: u64,
) -> Result<Bytes, ProcessingError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(ProcessingError::from_multer)? {
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(ProcessingError::EntityTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
