//! The response writer protocol.
//!
//! Every wrapper in the middleware stack implements [`ResponseWriter`] over the
//! writer it wraps. Besides the header/status/body operations, the trait has
//! three capability hooks:
//!
//! - [`ResponseWriter::try_flush`] and [`ResponseWriter::try_hijack`] return
//!   `None` when this level has nothing to contribute
//! - [`ResponseWriter::inner_mut`] unwraps one level
//!
//! The free functions [`flush`] and [`hijack`] walk the chain, trying the
//! capability at each level and unwrapping on `None`, so a wrapper that knows
//! nothing about flushing never hides the transport's flush from the handler.
//!
//! ```text
//! handler ─▶ RecoveryWriter ─▶ StatusWriter ─▶ GzipResponseWriter ─▶ transport
//!              try_flush          try_flush        try_flush           try_flush
//!              (marks written)    (records 200)    (commits buffer)    (sends frame)
//! ```

mod recorder;
mod status;

pub use recorder::ResponseRecorder;
pub use status::StatusWriter;

use crate::error::WriterError;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::io::{self, Read, Write};

/// A raw, bidirectional byte stream taken over by a hijack.
pub trait RawConnection: Read + Write + Send {}

impl<T> RawConnection for T where T: Read + Write + Send {}

/// Sink for one HTTP response.
///
/// Implementations are owned by a single request for its whole lifetime.
pub trait ResponseWriter: Send {
    /// Response headers. Changes after the status is sent have no effect.
    fn headers(&self) -> &HeaderMap;

    /// Mutable response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the response status.
    fn write_header(&mut self, status: StatusCode);

    /// Writes body bytes, implying `200 OK` if no status was set.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Writes all of `buf`.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole response body",
                    ))
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Flushes at this level, or `None` to defer to the wrapped writer.
    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        None
    }

    /// Hijacks at this level, or `None` to defer to the wrapped writer.
    fn try_hijack(&mut self) -> Option<Result<Box<dyn RawConnection>, WriterError>> {
        None
    }

    /// The wrapped writer, if this is a wrapper.
    fn inner_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
        None
    }
}

/// Flushes buffered response data through the whole chain.
pub fn flush(w: &mut dyn ResponseWriter) -> Result<(), WriterError> {
    let mut current = w;
    loop {
        if let Some(result) = current.try_flush() {
            return result;
        }
        current = current.inner_mut().ok_or(WriterError::FlushNotSupported)?;
    }
}

/// Takes over the raw connection from the innermost writer that supports it.
pub fn hijack(w: &mut dyn ResponseWriter) -> Result<Box<dyn RawConnection>, WriterError> {
    let mut current = w;
    loop {
        if let Some(result) = current.try_hijack() {
            return result;
        }
        current = current
            .inner_mut()
            .ok_or(WriterError::HijackNotSupported)?;
    }
}

/// Replies with a plain-text error body.
///
/// Any `Content-Length` set by earlier code is removed; the body is `message`
/// followed by a newline.
pub fn error_response(w: &mut dyn ResponseWriter, status: StatusCode, message: &str) {
    let headers = w.headers_mut();
    headers.remove(CONTENT_LENGTH);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    w.write_header(status);
    let mut body = String::with_capacity(message.len() + 1);
    body.push_str(message);
    body.push('\n');
    // Best effort: the client may already be gone.
    let _ = w.write_all(body.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A pass-through wrapper that implements no capabilities itself.
    struct Opaque<'a> {
        inner: &'a mut dyn ResponseWriter,
    }

    impl ResponseWriter for Opaque<'_> {
        fn headers(&self) -> &HeaderMap {
            self.inner.headers()
        }

        fn headers_mut(&mut self) -> &mut HeaderMap {
            self.inner.headers_mut()
        }

        fn write_header(&mut self, status: StatusCode) {
            self.inner.write_header(status);
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn inner_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
            Some(&mut *self.inner)
        }
    }

    /// A bottom-level writer with no capabilities at all.
    #[derive(Default)]
    struct Bare {
        headers: HeaderMap,
    }

    impl ResponseWriter for Bare {
        fn headers(&self) -> &HeaderMap {
            &self.headers
        }

        fn headers_mut(&mut self) -> &mut HeaderMap {
            &mut self.headers
        }

        fn write_header(&mut self, _status: StatusCode) {}

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn test_flush_walks_through_opaque_wrappers() {
        let mut rec = ResponseRecorder::new();
        {
            let mut first = Opaque { inner: &mut rec };
            let mut second = Opaque { inner: &mut first };
            flush(&mut second).unwrap();
        }
        assert_eq!(rec.flush_count(), 1);
    }

    #[test]
    fn test_hijack_walks_through_opaque_wrappers() {
        let mut rec = ResponseRecorder::new().with_connection(Cursor::new(Vec::new()));
        {
            let mut first = Opaque { inner: &mut rec };
            let mut second = Opaque { inner: &mut first };
            let mut conn = hijack(&mut second).unwrap();
            conn.write_all(b"raw").unwrap();
        }
        assert!(rec.is_hijacked());
    }

    #[test]
    fn test_unsupported_capabilities_are_typed() {
        let mut bare = Bare::default();
        let mut wrapped = Opaque { inner: &mut bare };

        assert!(matches!(
            flush(&mut wrapped),
            Err(WriterError::FlushNotSupported)
        ));
        assert!(matches!(
            hijack(&mut wrapped),
            Err(WriterError::HijackNotSupported)
        ));
    }

    #[test]
    fn test_error_response() {
        let mut rec = ResponseRecorder::new();
        rec.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("999"));

        error_response(&mut rec, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");

        assert_eq!(rec.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rec.header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(rec.header("x-content-type-options"), Some("nosniff"));
        assert_eq!(rec.header("content-length"), None);
        assert_eq!(rec.body_string(), "Too Many Requests\n");
    }

    #[test]
    fn test_write_all_loops_on_short_writes() {
        struct OneByte {
            headers: HeaderMap,
            out: Vec<u8>,
        }

        impl ResponseWriter for OneByte {
            fn headers(&self) -> &HeaderMap {
                &self.headers
            }
            fn headers_mut(&mut self) -> &mut HeaderMap {
                &mut self.headers
            }
            fn write_header(&mut self, _status: StatusCode) {}
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.out.push(buf[0]);
                Ok(1)
            }
        }

        let mut w = OneByte {
            headers: HeaderMap::new(),
            out: Vec::new(),
        };
        w.write_all(b"abc").unwrap();
        assert_eq!(w.out, b"abc");
    }
}
