//! Error types for striptile_core.

use thiserror::Error;

/// Error types for tile and crop operations.
///
/// Stale disk metadata is deliberately not a variant: stale entries are
/// recomputed silently. Cache-write failures are swallowed at the call site
/// and never surface here either.
#[derive(Error, Debug)]
pub enum TileError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task aborted")]
    Aborted,
}

impl TileError {
    /// Whether this error maps to a client-visible miss rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TileError::NotFound(_))
    }
}

/// Result type alias for tile operations.
pub type TileResult<T> = Result<T, TileError>;
