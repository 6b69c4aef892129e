//! The decision-deferring gzip response writer.

use super::pool::PooledEncoder;
use super::sniff::detect_content_type;
use crate::error::WriterError;
use crate::writer::{flush, hijack, RawConnection, ResponseWriter};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::io;

/// Media types that are already compressed or otherwise not worth gzipping.
const COMPRESSED_TYPES: &[&str] = &[
    "application/gzip",
    "application/zip",
    "application/x-gzip",
    "application/x-compressed",
    "application/x-bzip2",
    "application/x-xz",
    "application/zstd",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "audio/mpeg",
    "audio/ogg",
    "video/mp4",
    "video/webm",
    "application/octet-stream",
    "application/x-tar",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
    "application/vnd.rar",
    "application/java-archive",
    "application/wasm",
    "font/woff",
    "font/woff2",
    "application/font-woff",
    "application/x-font-woff",
    "application/pdf",
    "application/x-shockwave-flash",
];

/// Whether a media type (parameters allowed) is on the already-compressed list.
pub fn is_compressed_type(content_type: &str) -> bool {
    let essence = content_type.parse::<mime::Mime>().map_or_else(
        |_| {
            content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        },
        |m| m.essence_str().to_string(),
    );
    COMPRESSED_TYPES.contains(&essence.as_str())
}

/// Where the writer is in its one-way decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Body bytes are still being buffered.
    Pending,
    /// Headers were committed with `Content-Encoding: gzip`.
    Compress,
    /// Headers were committed unchanged; bytes pass through.
    Skip,
}

/// Buffers the start of a response, then commits to gzip or passthrough.
///
/// Body bytes accumulate until the buffer reaches `min_size`, the handler
/// flushes, or the response ends. At that point the writer decides once:
///
/// - skip for an already-compressed content type (declared, or sniffed from
///   the buffer when undeclared), a body shorter than `min_size`, an existing
///   `Content-Encoding`, a `204`, `206` or `304`, or any `1xx`
/// - otherwise set `Content-Encoding: gzip`, drop `Content-Length`, make sure
///   `Content-Type` is set, and stream the buffer through the encoder
///
/// The status is held back until the decision. A hijack marks the writer so
/// that [`GzipResponseWriter::close`] leaves the connection alone.
pub struct GzipResponseWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    encoder: PooledEncoder,
    buf: Vec<u8>,
    status: Option<StatusCode>,
    min_size: usize,
    decision: Decision,
    hijacked: bool,
    commit_error: Option<(io::ErrorKind, String)>,
}

impl<'a> GzipResponseWriter<'a> {
    /// Wraps `inner`, compressing through `encoder` once committed.
    pub fn new(inner: &'a mut dyn ResponseWriter, encoder: PooledEncoder, min_size: usize) -> Self {
        Self {
            inner,
            encoder,
            buf: Vec::new(),
            status: None,
            min_size,
            decision: Decision::Pending,
            hijacked: false,
            commit_error: None,
        }
    }

    /// The decision taken so far.
    pub fn decision(&self) -> Decision {
        self.decision
    }

    /// Whether the connection was hijacked through this writer.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Commits any pending buffer and terminates the gzip stream.
    ///
    /// Does nothing after a hijack.
    pub fn close(&mut self) -> io::Result<()> {
        if self.hijacked {
            return Ok(());
        }
        self.commit();
        if let Some(err) = self.commit_error() {
            return Err(err);
        }
        if self.decision == Decision::Compress {
            self.encoder.stream().finish(&mut *self.inner)?;
        }
        Ok(())
    }

    /// Cleanup after the handler panicked.
    ///
    /// Terminates the gzip stream only if compressed bytes already went out,
    /// so the client sees a well-formed (if truncated) body. Nothing is
    /// committed that the handler had not already committed.
    pub fn abandon(&mut self) {
        if self.decision == Decision::Compress && !self.hijacked {
            let _ = self.encoder.stream().finish(&mut *self.inner);
        }
    }

    fn commit_error(&self) -> Option<io::Error> {
        self.commit_error
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }

    fn declared_content_type(&self) -> Option<&str> {
        self.inner
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    fn should_skip(&self) -> bool {
        let content_type = self
            .declared_content_type()
            .unwrap_or_else(|| detect_content_type(&self.buf));
        let status = self.status.unwrap_or(StatusCode::OK);
        let already_encoded = self
            .inner
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|v| !v.is_empty());

        is_compressed_type(content_type)
            || self.buf.len() < self.min_size
            || already_encoded
            || matches!(
                status,
                StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::PARTIAL_CONTENT
            )
            || status.is_informational()
    }

    fn commit(&mut self) {
        if self.decision != Decision::Pending {
            return;
        }

        let skip = self.should_skip();
        self.decision = if skip {
            Decision::Skip
        } else {
            Decision::Compress
        };
        sluice_telemetry::metrics::record_compression_decision(if skip {
            "skip"
        } else {
            "compress"
        });

        let status = *self.status.get_or_insert(StatusCode::OK);

        if !skip {
            if self.declared_content_type().is_none() {
                let sniffed = detect_content_type(&self.buf);
                self.inner
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(sniffed));
            }
            let headers = self.inner.headers_mut();
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.remove(CONTENT_LENGTH);
        }

        self.inner.write_header(status);

        if !self.buf.is_empty() {
            let buf = std::mem::take(&mut self.buf);
            let result = if skip {
                self.inner.write_all(&buf)
            } else {
                self.encoder.stream().write(&buf, &mut *self.inner)
            };
            if let Err(err) = result {
                self.commit_error = Some((err.kind(), err.to_string()));
            }
        }
    }
}

impl ResponseWriter for GzipResponseWriter<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hijacked {
            return Err(WriterError::Hijacked.into_io());
        }
        if let Some(err) = self.commit_error() {
            return Err(err);
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }

        match self.decision {
            Decision::Skip => self.inner.write(buf),
            Decision::Compress => {
                self.encoder.stream().write(buf, &mut *self.inner)?;
                Ok(buf.len())
            }
            Decision::Pending => {
                self.buf.extend_from_slice(buf);
                if self.buf.len() >= self.min_size {
                    self.commit();
                    if let Some(err) = self.commit_error() {
                        return Err(err);
                    }
                }
                Ok(buf.len())
            }
        }
    }

    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        if self.hijacked {
            return Some(Err(WriterError::Hijacked));
        }
        self.commit();
        if let Some(err) = self.commit_error() {
            return Some(Err(err.into()));
        }
        if self.decision == Decision::Compress {
            if let Err(err) = self.encoder.stream().flush(&mut *self.inner) {
                return Some(Err(err.into()));
            }
        }
        Some(flush(&mut *self.inner))
    }

    fn try_hijack(&mut self) -> Option<Result<Box<dyn RawConnection>, WriterError>> {
        let result = hijack(&mut *self.inner);
        if result.is_ok() {
            self.hijacked = true;
        }
        Some(result)
    }

    fn inner_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
        Some(&mut *self.inner)
    }
}
