//! In-memory `multipart/form-data` encoder for the rewritten body.
//!
//! Each writer owns a freshly generated boundary. Parts are appended in
//! call order; [`MultipartWriter::finish`] seals the body with the closing
//! delimiter and hands back the exact bytes that will be forwarded.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug)]
pub struct MultipartWriter {
    boundary: String,
    buf: BytesMut,
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_boundary(format!("gatehouse-{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buf: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Bytes written so far, excluding the closing delimiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_field(&mut self, name: &str, value: &str) {
        self.write_part(name, None, None, value.as_bytes());
    }

    pub fn write_part(
        &mut self,
        name: &str,
        file_name: Option<&str>,
        content_type: Option<&str>,
        data: &[u8],
    ) {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
        self.buf.put_slice(escape_quoted(name).as_bytes());
        self.buf.put_u8(b'"');
        if let Some(file_name) = file_name {
            self.buf.put_slice(b"; filename=\"");
            self.buf.put_slice(escape_quoted(file_name).as_bytes());
            self.buf.put_u8(b'"');
        }
        if let Some(content_type) = content_type {
            self.buf.put_slice(b"\r\nContent-Type: ");
            self.buf.put_slice(content_type.as_bytes());
        }
        self.buf.put_slice(b"\r\n\r\n");
        self.buf.put_slice(data);
        self.buf.put_slice(b"\r\n");
    }

    #[must_use]
    pub fn finish(mut self) -> Bytes {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"--\r\n");
        self.buf.freeze()
    }
}

/// Quoted-string escaping for `name` and `filename`. Line breaks are
/// percent-encoded as browsers do, so a header line never ends early.
fn escape_quoted(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
