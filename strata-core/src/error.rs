//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Every variant is cheaply cloneable because the cancellation tree
//! hands the first captured error to every waiter.

use std::path::PathBuf;
use thiserror::Error;

use crate::provider::ProviderError;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for strata.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    // Remote provider errors
    #[error(transparent)]
    Provider(#[from] ProviderError),

    // Reference graph errors
    #[error("stack '{stack}' references itself")]
    SelfReference { stack: String },

    #[error("stack '{stack}' not found")]
    UnknownStack { stack: String },

    #[error("cyclic dependency between stacks: {}", chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    #[error("parent stack '{stack}' is not ready")]
    ParentNotReady {
        stack: String,
        #[source]
        source: Box<Error>,
    },

    // Template errors
    #[error("template error: {reason}")]
    Template { reason: String },

    // User interaction
    #[error("changes are not approved")]
    NotApproved,

    // Lifecycle operation wrappers
    #[error("cannot plan stack '{stack}'")]
    PlanFailed {
        stack: String,
        #[source]
        source: Box<Error>,
    },

    #[error("cannot execute change set on stack '{stack}'")]
    ExecuteFailed {
        stack: String,
        #[source]
        source: Box<Error>,
    },

    #[error("cannot destroy stack '{stack}'")]
    DestroyFailed {
        stack: String,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    /// Create a template error.
    pub fn template(reason: impl Into<String>) -> Self {
        Self::Template { reason: reason.into() }
    }

    /// Create an I/O error for a path, keeping only the message so the
    /// error stays cloneable.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io { path: path.into(), message: err.to_string() }
    }

    /// Create a generic error from a message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Render the full cause chain, outermost first.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}
