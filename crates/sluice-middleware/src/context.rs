//! Request-scoped context.
//!
//! The only value middlewares pass forward is the per-request identifier.
//! It lives in the request's [`http::Extensions`] as a [`RequestId`] and is
//! read through [`RequestExt`]. Absence is a valid state: loggers simply omit
//! the field.
//!
//! # Example
//!
//! ```
//! use sluice_middleware::context::RequestExt;
//!
//! let mut request = http::Request::new(bytes::Bytes::new());
//! assert_eq!(request.request_id(), None);
//!
//! request.set_request_id("0191b3c4d5e6f708");
//! assert_eq!(request.request_id(), Some("0191b3c4d5e6f708"));
//! ```

use std::fmt;

/// Header carrying the request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The per-request identifier stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access to the request identifier on an [`http::Request`].
pub trait RequestExt {
    /// Returns the request identifier, if one was assigned.
    fn request_id(&self) -> Option<&str>;

    /// Assigns the request identifier, replacing any previous one.
    fn set_request_id(&mut self, id: impl Into<String>);
}

impl<B> RequestExt for http::Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions().get::<RequestId>().map(RequestId::as_str)
    }

    fn set_request_id(&mut self, id: impl Into<String>) {
        self.extensions_mut().insert(RequestId::new(id));
    }
}
