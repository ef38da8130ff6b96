//! Stable error taxonomy shared across the core and application crates.
//!
//! Every fallible core operation returns a [`CoreError`] tagged with one of a
//! small, closed set of kinds. Callers at the edges (CLI, HTTP, Event Queue)
//! map these onto exit codes, JSON-RPC error codes, or retry decisions
//! without needing to pattern-match on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("transient failure, retry: {0}")]
    Retry(String),

    #[error("embedding backend error: {0}")]
    Backend(String),

    #[error("corrupt state, regeneration required: {0}")]
    Corrupt(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
