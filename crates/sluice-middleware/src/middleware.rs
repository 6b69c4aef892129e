//! Core middleware trait.
//!
//! A middleware turns the next handler into a new handler. The wrapping
//! handler may rewrite the request, wrap the response writer, answer the
//! request itself, or pass it through.
//!
//! # Example
//!
//! ```
//! use sluice_middleware::handler::{handler_fn, BoxHandler, Handler};
//! use sluice_middleware::middleware::Middleware;
//! use http::HeaderValue;
//!
//! struct PoweredBy;
//!
//! impl Middleware for PoweredBy {
//!     fn name(&self) -> &'static str {
//!         "powered_by"
//!     }
//!
//!     fn wrap(&self, next: BoxHandler) -> BoxHandler {
//!         handler_fn(move |w, req| {
//!             w.headers_mut()
//!                 .insert("x-powered-by", HeaderValue::from_static("sluice"));
//!             next.serve(w, req);
//!         })
//!     }
//! }
//! ```

use crate::handler::BoxHandler;
use std::fmt;

/// A `(next handler) -> handler` transformation.
pub trait Middleware: Send + Sync + 'static {
    /// Returns the name of this middleware for logging and debugging.
    fn name(&self) -> &'static str;

    /// Wraps `next`.
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

/// A middleware built from a closure.
pub struct FnMiddleware<F> {
    name: &'static str,
    f: F,
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        (self.f)(next)
    }
}

/// Adapts a closure into a named [`Middleware`].
pub fn middleware_fn<F>(name: &'static str, f: F) -> FnMiddleware<F>
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    FnMiddleware { name, f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::writer::{ResponseRecorder, ResponseWriter};
    use bytes::Bytes;
    use http::StatusCode;

    #[test]
    fn test_fn_middleware_short_circuits() {
        let deny = middleware_fn("deny", |_next| {
            handler_fn(|w, _req| w.write_header(StatusCode::FORBIDDEN))
        });
        assert_eq!(deny.name(), "deny");

        let handler = deny.wrap(handler_fn(|w, _req| {
            let _ = w.write_all(b"unreachable");
        }));

        let mut rec = ResponseRecorder::new();
        handler.serve(&mut rec, http::Request::new(Bytes::new()));
        assert_eq!(rec.status(), StatusCode::FORBIDDEN);
        assert!(rec.body().is_empty());
    }
}
