//! Ordered middleware chains.
//!
//! A [`Chain`] composes middlewares around a handler. The first middleware
//! added is the outermost: it sees the request first and the response last.
//!
//! ```text
//! Chain::new().with(A).with(B).then(h)  ==  A(B(h))
//! ```

use crate::handler::BoxHandler;
use crate::middleware::Middleware;
use std::fmt;
use std::sync::Arc;

/// An ordered list of middlewares.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("middlewares", &self.names())
            .finish()
    }
}

impl Chain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware inside the ones already added.
    pub fn with<M: Middleware>(mut self, middleware: M) -> Self {
        self.push(middleware);
        self
    }

    /// Appends a middleware inside the ones already added.
    pub fn push<M: Middleware>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Wraps `handler` in every middleware of the chain.
    pub fn then(&self, handler: BoxHandler) -> BoxHandler {
        self.middlewares
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware.wrap(next))
    }

    /// Middleware names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Number of middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}
