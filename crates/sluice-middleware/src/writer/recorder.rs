//! In-memory response sink.

use super::{RawConnection, ResponseWriter};
use crate::error::WriterError;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::io;

/// Records a response in memory.
///
/// The recorder is the bottom of the writer chain in tests and in callers
/// that want a buffered response. It supports flushing (counted) and, when
/// given a connection with [`ResponseRecorder::with_connection`], hijacking.
///
/// Headers are snapshotted when the status is first sent, so later header
/// changes are visible through [`ResponseRecorder::headers`] but not through
/// [`ResponseRecorder::header`], mirroring what a client would receive.
#[derive(Default)]
pub struct ResponseRecorder {
    headers: HeaderMap,
    sent_headers: Option<HeaderMap>,
    status: Option<StatusCode>,
    body: Vec<u8>,
    flushes: usize,
    connection: Option<Box<dyn RawConnection>>,
    hijacked: bool,
}

impl ResponseRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the recorder hijackable, handing out `connection` on hijack.
    pub fn with_connection(mut self, connection: impl RawConnection + 'static) -> Self {
        self.connection = Some(Box::new(connection));
        self
    }

    /// The status sent, `200 OK` if none was.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Whether a status was sent explicitly or implied by a body write.
    pub fn wrote_header(&self) -> bool {
        self.status.is_some()
    }

    /// A header value as the client would see it.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.sent_headers
            .as_ref()
            .unwrap_or(&self.headers)
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    /// Every value of a header as the client would see it.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.sent_headers
            .as_ref()
            .unwrap_or(&self.headers)
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// The recorded body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The recorded body as lossy UTF-8.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// How many successful flushes reached the recorder.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Whether the connection was hijacked.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    fn send_head(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
            self.sent_headers = Some(self.headers.clone());
        }
    }
}

impl fmt::Debug for ResponseRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecorder")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("flushes", &self.flushes)
            .field("hijacked", &self.hijacked)
            .finish_non_exhaustive()
    }
}

impl ResponseWriter for ResponseRecorder {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if !self.hijacked {
            self.send_head(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hijacked {
            return Err(WriterError::Hijacked.into_io());
        }
        self.send_head(StatusCode::OK);
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        if self.hijacked {
            return Some(Err(WriterError::Hijacked));
        }
        self.flushes += 1;
        Some(Ok(()))
    }

    fn try_hijack(&mut self) -> Option<Result<Box<dyn RawConnection>, WriterError>> {
        if self.hijacked {
            return Some(Err(WriterError::AlreadyHijacked));
        }
        let connection = self.connection.take()?;
        self.hijacked = true;
        Some(Ok(connection))
    }
}
