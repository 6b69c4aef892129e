//! Panic recovery middleware.
//!
//! Catches panics from the wrapped handler, logs them with the panic value,
//! a backtrace captured at the panic site, and the request's method, path and
//! identifier, then answers `500 Internal Server Error` if nothing has reached
//! the client yet. When the status line is already out, only the log entry is
//! emitted.
//!
//! A panic whose payload is [`AbortHandler`] is not recovered. It is re-raised
//! so the transport can drop the connection.
//!
//! Place this middleware outermost so it also covers the other stages.

use crate::context::{RequestExt, REQUEST_ID_HEADER};
use crate::error::WriterError;
use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use crate::writer::{error_response, flush, hijack, RawConnection, ResponseWriter};
use http::{HeaderMap, StatusCode};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

/// Panic payload that asks the transport to abort the connection.
///
/// ```should_panic
/// std::panic::panic_any(sluice_middleware::stages::AbortHandler);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortHandler;

impl AbortHandler {
    /// Unwinds with this sentinel as the payload.
    pub fn raise() -> ! {
        panic::resume_unwind(Box::new(Self))
    }
}

/// Tracks whether any part of the response has been committed.
///
/// A final status (`>= 200` or `101`), a body write, a successful flush, or a
/// successful hijack all count. Informational statuses other than `101` do
/// not.
pub struct RecoveryWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    written: bool,
}

impl<'a> RecoveryWriter<'a> {
    /// Wraps `inner`.
    pub fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            written: false,
        }
    }

    /// Whether the response has started.
    pub fn is_written(&self) -> bool {
        self.written
    }
}

impl ResponseWriter for RecoveryWriter<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if status == StatusCode::SWITCHING_PROTOCOLS || !status.is_informational() {
            self.written = true;
        }
        self.inner.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = true;
        self.inner.write(buf)
    }

    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        let result = flush(&mut *self.inner);
        if result.is_ok() {
            self.written = true;
        }
        Some(result)
    }

    fn try_hijack(&mut self) -> Option<Result<Box<dyn RawConnection>, WriterError>> {
        let result = hijack(&mut *self.inner);
        if result.is_ok() {
            self.written = true;
        }
        Some(result)
    }

    fn inner_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
        Some(&mut *self.inner)
    }
}

thread_local! {
    static RECOVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Chains a panic hook that records a backtrace instead of printing while
/// the panicking thread is inside a recovery scope.
fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RECOVERY_DEPTH.with(Cell::get) > 0 {
                let trace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

struct RecoveryScope;

impl RecoveryScope {
    fn enter() -> Self {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for RecoveryScope {
    fn drop(&mut self) {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

/// Renders a panic payload the way the default hook does.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Converts handler panics into logged `500` responses.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMiddleware {
    logger: Logger,
}

impl RecoveryMiddleware {
    /// Creates the middleware.
    pub fn new(logger: Logger) -> Self {
        install_panic_hook();
        Self { logger }
    }
}

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        install_panic_hook();
        let logger = self.logger.clone();

        handler_fn(move |w, req| {
            let method = req.method().clone();
            let path = req.uri().path().to_owned();
            let inbound_id = req.request_id().map(str::to_owned);

            let mut rw = RecoveryWriter::new(w);
            let outcome = {
                let _scope = RecoveryScope::enter();
                panic::catch_unwind(AssertUnwindSafe(|| next.serve(&mut rw, req)))
            };
            let Err(payload) = outcome else {
                return;
            };

            let stack = take_backtrace();
            if payload.is::<AbortHandler>() {
                panic::resume_unwind(payload);
            }

            // Stages inside this one may have assigned the id after we saw the
            // request; the response header still carries it.
            let request_id = inbound_id.or_else(|| {
                rw.headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            });
            let message = panic_message(&*payload);
            let written = rw.is_written();
            sluice_telemetry::metrics::record_panic_recovered(written);

            logger.scope(|| {
                if written {
                    tracing::error!(
                        panic = %message,
                        stack = %stack,
                        method = %method,
                        path = %path,
                        request_id = request_id.as_deref(),
                        response_already_written = true,
                        "panic recovered after response was already written"
                    );
                } else {
                    tracing::error!(
                        panic = %message,
                        stack = %stack,
                        method = %method,
                        path = %path,
                        request_id = request_id.as_deref(),
                        "panic recovered"
                    );
                }
            });

            if !written {
                error_response(&mut rw, StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::logger::testing::CapturedLogs;
    use crate::writer::ResponseRecorder;
    use bytes::Bytes;
    use http::HeaderValue;
    use std::io::Cursor;

    fn request() -> crate::handler::Request {
        http::Request::builder()
            .method("POST")
            .uri("/orders?x=1")
            .body(Bytes::new())
            .unwrap()
    }

    fn recover(handler: BoxHandler) -> (ResponseRecorder, CapturedLogs) {
        let logs = CapturedLogs::default();
        let handler = RecoveryMiddleware::new(logs.logger()).wrap(handler);
        let mut rec = ResponseRecorder::new();
        handler.serve(&mut rec, request());
        (rec, logs)
    }

    #[test]
    fn test_passthrough_without_panic() {
        let (rec, logs) = recover(handler_fn(|w, _req| {
            let _ = w.write_all(b"fine");
        }));
        assert_eq!(rec.status(), StatusCode::OK);
        assert_eq!(rec.body(), b"fine");
        assert!(logs.lines().is_empty());
    }

    #[test]
    fn test_panic_before_write_returns_500() {
        let (rec, logs) = recover(handler_fn(|w, _req| {
            w.headers_mut()
                .insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));
            panic!("boom");
        }));

        assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(rec.body_string(), "Internal Server Error\n");

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        let fields = &lines[0]["fields"];
        assert_eq!(lines[0]["level"], "ERROR");
        assert_eq!(fields["message"], "panic recovered");
        assert_eq!(fields["panic"], "boom");
        assert_eq!(fields["method"], "POST");
        assert_eq!(fields["path"], "/orders");
        assert_eq!(fields["request_id"], "req-42");
        assert!(!fields["stack"].as_str().unwrap().is_empty());
        assert!(fields.get("response_already_written").is_none());
    }

    #[test]
    fn test_panic_after_write_only_logs() {
        let (rec, logs) = recover(handler_fn(|w, _req| {
            w.write_header(StatusCode::ACCEPTED);
            let _ = w.write_all(b"partial");
            panic!("late failure {}", 7);
        }));

        assert_eq!(rec.status(), StatusCode::ACCEPTED);
        assert_eq!(rec.body(), b"partial");

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        let fields = &lines[0]["fields"];
        assert_eq!(
            fields["message"],
            "panic recovered after response was already written"
        );
        assert_eq!(fields["panic"], "late failure 7");
        assert_eq!(fields["response_already_written"], true);
        assert!(fields.get("request_id").is_none());
    }

    #[test]
    fn test_informational_status_does_not_count_as_written() {
        let (rec, _logs) = recover(handler_fn(|w, _req| {
            w.write_header(StatusCode::from_u16(103).unwrap());
            panic!("after early hints");
        }));
        // The recorder keeps the first status it saw.
        assert_eq!(rec.status().as_u16(), 103);
        assert_eq!(rec.body_string(), "Internal Server Error\n");
    }

    #[test]
    fn test_abort_sentinel_is_reraised() {
        let logs = CapturedLogs::default();
        let handler = RecoveryMiddleware::new(logs.logger())
            .wrap(handler_fn(|_w, _req| AbortHandler::raise()));

        let mut rec = ResponseRecorder::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.serve(&mut rec, request())));

        let payload = result.unwrap_err();
        assert!(payload.is::<AbortHandler>());
        assert!(!rec.wrote_header());
        assert!(logs.lines().is_empty());
    }

    #[test]
    fn test_flush_and_hijack_mark_written() {
        let mut rec = ResponseRecorder::new();
        let mut rw = RecoveryWriter::new(&mut rec);
        assert!(!rw.is_written());
        flush(&mut rw).unwrap();
        assert!(rw.is_written());

        let mut rec = ResponseRecorder::new().with_connection(Cursor::new(Vec::new()));
        let mut rw = RecoveryWriter::new(&mut rec);
        hijack(&mut rw).unwrap();
        assert!(rw.is_written());

        let mut rec = ResponseRecorder::new();
        let mut rw = RecoveryWriter::new(&mut rec);
        assert!(hijack(&mut rw).is_err());
        assert!(!rw.is_written());
    }

    #[test]
    fn test_switching_protocols_counts_as_written() {
        let mut rec = ResponseRecorder::new();
        let mut rw = RecoveryWriter::new(&mut rec);
        rw.write_header(StatusCode::SWITCHING_PROTOCOLS);
        assert!(rw.is_written());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "Box<dyn Any>");
    }
}
