//! Error kinds.

use thiserror::Error;

/// Host-runtime instrumentation facility failures.
#[derive(Debug, Error, Clone)]
pub enum HostError {
    #[error("host runtime instrumentation facility is unavailable")]
    Unavailable,
    #[error("failed to retransform class {class}: {reason}")]
    RetransformFailed { class: String, reason: String },
}

/// Class-rewrite failures.
#[derive(Debug, Error, Clone)]
pub enum TransformError {
    #[error("class {0} is not modifiable")]
    NotModifiable(String),

    /// The runtime could not call `enter` before the superclass
    /// constructor returns, and no coherent entry point exists -- the
    /// method is skipped rather than instrumented with a mismatched
    /// enter/leave pair.
    #[error("method {0} cannot be instrumented before its superclass constructor returns")]
    SuperConstructorUnreachable(String),

    #[error("bytecode rewrite failed for {method}: {reason}")]
    RewriteFailed { method: String, reason: String },
}

/// Command-syntax / semantic errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unrecognized command {0:?}")]
    UnrecognizedCommand(String),

    #[error("invalid trace target syntax: {0:?}")]
    InvalidTarget(String),

    #[error("pattern {0:?} matches every class in the process and is not allowed")]
    TooBroad(String),

    #[error("save path must be absolute, got {0:?}")]
    RelativeSavePath(String),
}
