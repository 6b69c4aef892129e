//! Injected diagnostics sink.
//!
//! Every middleware takes a [`Logger`] at construction instead of reaching for
//! a process-wide logger at call time. A logger either forwards to whatever
//! `tracing` subscriber is current, or scopes its events to a dispatcher it
//! owns.

use tracing::Dispatch;

/// A cloneable handle that decides where a component's events go.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    dispatch: Option<Dispatch>,
}

impl Logger {
    /// A logger that emits to the current default subscriber.
    pub fn current() -> Self {
        Self::default()
    }

    /// A logger that emits to `dispatch` regardless of the process default.
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }

    /// Runs `f` with this logger's dispatcher as the default.
    ///
    /// Only wrap event emission in a scope, never a downstream handler call,
    /// or the handler's own events would be redirected too.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl From<Dispatch> for Logger {
    fn from(dispatch: Dispatch) -> Self {
        Self::new(dispatch)
    }
}
