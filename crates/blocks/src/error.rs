use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoadError>;

/// Failures while building a [`crate::BlockStore`]. Fatal: a store that fails to load is unusable.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Duplicate block name '{name}' (first defined in {first}, again in {second})")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },

    #[error("Malformed trigger for block '{block}': {reason}")]
    MalformedTrigger { block: String, reason: String },

    #[error("Invalid document {origin}: {reason}")]
    InvalidDocument { origin: String, reason: String },

    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory walk failed: {0}")]
    Walk(#[from] ignore::Error),
}

/// A trigger kind this evaluator does not know how to decide.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("Unsupported trigger kind '{kind}' on block '{block}'")]
pub struct UnsupportedTriggerError {
    pub block: String,
    pub kind: String,
}

/// Per-block failure of a delegation hook. Recoverable: reported next to the partial output.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RetrievalError {
    #[error("No delegation hook named '{hook}'")]
    UnknownHook { hook: String },

    #[error("Agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Agent '{agent}' timed out after {after_ms}ms")]
    Timeout { agent: String, after_ms: u64 },

    #[error("Agent '{agent}' returned no text")]
    EmptyResponse { agent: String },

    /// `scope` is the document searched, or `corpus` when every document was searched.
    #[error("Section '{section}' not found in {scope}")]
    SectionNotFound { scope: String, section: String },

    #[error("Invalid delegation request: {message}")]
    InvalidRequest { message: String },

    #[error("IO error: {message}")]
    Io { message: String },
}

/// Errors that abort a whole `resolve` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    UnsupportedTrigger(#[from] UnsupportedTriggerError),

    #[error("Resolution cancelled")]
    Cancelled,
}
