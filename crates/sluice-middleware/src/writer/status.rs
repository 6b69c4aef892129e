//! Status-capturing wrapper.

use super::{flush, hijack, RawConnection, ResponseWriter};
use crate::error::WriterError;
use http::{HeaderMap, StatusCode};
use std::io;

/// Records the effective status of a response for the access log.
///
/// The first status wins; later `write_header` calls are dropped rather than
/// forwarded. A body write or a successful flush without a status records
/// `200 OK`. A successful hijack is remembered so a response with no status
/// can be logged as `101 Switching Protocols`.
pub struct StatusWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    status: Option<StatusCode>,
    hijacked: bool,
    bytes_written: u64,
}

impl<'a> StatusWriter<'a> {
    /// Wraps `inner`.
    pub fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            status: None,
            hijacked: false,
            bytes_written: 0,
        }
    }

    /// The recorded status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The status to report: the recorded one, else `101` after a hijack,
    /// else `200`.
    pub fn effective_status(&self) -> StatusCode {
        match self.status {
            Some(status) => status,
            None if self.hijacked => StatusCode::SWITCHING_PROTOCOLS,
            None => StatusCode::OK,
        }
    }

    /// Whether the connection was hijacked through this writer.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Body bytes accepted by the wrapped writer.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl ResponseWriter for StatusWriter<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
            self.inner.write_header(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        let n = self.inner.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        let result = flush(&mut *self.inner);
        if result.is_ok() && self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        Some(result)
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
