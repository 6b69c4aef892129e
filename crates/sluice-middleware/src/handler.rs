//! Handler contract.
//!
//! A handler receives the response writer and a request whose body has already
//! been collected. Handlers are synchronous: they run on a worker thread per
//! in-flight request and write the response through the writer.

use crate::writer::ResponseWriter;
use bytes::Bytes;
use std::sync::Arc;

/// A request with its body collected.
pub type Request = http::Request<Bytes>;

/// Something that can answer a request.
pub trait Handler: Send + Sync + 'static {
    /// Writes the response for `req` to `w`.
    fn serve(&self, w: &mut dyn ResponseWriter, req: Request);
}

impl<F> Handler for F
where
    F: Fn(&mut dyn ResponseWriter, Request) + Send + Sync + 'static,
{
    fn serve(&self, w: &mut dyn ResponseWriter, req: Request) {
        self(w, req);
    }
}

/// A shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

/// Boxes a closure as a handler.
///
/// # Example
///
/// ```
/// use sluice_middleware::handler::{handler_fn, Handler};
/// use sluice_middleware::writer::ResponseRecorder;
///
/// let hello = handler_fn(|w, _req| {
///     let _ = w.write_all(b"hello");
/// });
///
/// let mut rec = ResponseRecorder::new();
/// hello.serve(&mut rec, http::Request::new(bytes::Bytes::new()));
/// assert_eq!(rec.body(), b"hello");
/// ```
pub fn handler_fn<F>(f: F) -> BoxHandler
where
    F: Fn(&mut dyn ResponseWriter, Request) + Send + Sync + 'static,
{
    Arc::new(f)
}
