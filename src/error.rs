//! Error taxonomy for the ingestion core.
//!
//! Connector-level failures never surface as errors from the
//! [`ConnectionManager`](crate::manager::ConnectionManager); they are
//! contained and turned into status transitions. The variants here cover
//! everything that *does* cross an API boundary.

use thiserror::Error;

/// Errors surfaced by the ingestion core.
#[derive(Debug, Error)]
pub enum UnshubError {
    /// Bad configuration, rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation referenced an unknown connection or topic id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Outbound send attempted while the connection is not Connected.
    #[error("connection '{0}' is not connected")]
    NotConnected(String),

    /// Storage failure that is expected to clear on retry (lock
    /// contention, "database is locked", disposed-handle races).
    #[error("transient storage failure: {0}")]
    TransientStorage(String),

    /// Storage failure that will not clear on retry; propagated to the
    /// calling pipeline stage immediately.
    #[error("storage failure: {0}")]
    FatalStorage(String),
}

impl UnshubError {
    /// Whether the retry policy should re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UnshubError>;
