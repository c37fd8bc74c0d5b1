//! Engine-wide error type.
//!
//! Operators are free of recovery logic; every error propagates with `?` to
//! the execution boundary, unwinding all scoped resources on the way. The
//! boundary converts the error into the export format's error representation.

/// Why a query was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit user cancel.
    Manual,
    /// Deadline passed.
    Timeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Manual => f.write_str("manually cancelled"),
            CancelReason::Timeout => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// Expected control flow: the query was cancelled cooperatively.
    #[error("Query {reason} during {phase}")]
    Cancelled {
        reason: CancelReason,
        phase: &'static str,
    },

    #[error("Memory limit exceeded: limit {limit} bytes, requested {requested} more bytes")]
    MemoryLimitExceeded { limit: usize, requested: usize },

    /// User-facing: the query uses something the engine does not support.
    #[error("Unsupported query feature: {0}")]
    UnsupportedFeature(String),

    /// A planner or operator invariant was violated; indicates a bug.
    #[error("Internal contract violated: {0}")]
    ContractViolation(String),

    #[error("Index error: {0}")]
    IndexFormat(String),

    /// SERVICE endpoint failure (fatal unless the pattern is SILENT).
    #[error("Remote endpoint error: {0}")]
    RemoteEndpoint(String),

    #[error("Export error: {0}")]
    Export(String),
}

impl QueryError {
    /// Short machine-readable kind for the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Cancelled { .. } => "CancellationError",
            QueryError::MemoryLimitExceeded { .. } => "MemoryLimitExceeded",
            QueryError::UnsupportedFeature(_) => "UnsupportedQueryFeature",
            QueryError::ContractViolation(_) => "ContractError",
            QueryError::IndexFormat(_) => "IndexFormatError",
            QueryError::RemoteEndpoint(_) => "RemoteEndpointError",
            QueryError::Export(_) => "ExportError",
        }
    }

    /// Re-tag a cancellation with the phase it interrupted.
    pub fn with_phase(self, phase: &'static str) -> QueryError {
        match self {
            QueryError::Cancelled { reason, .. } => QueryError::Cancelled { reason, phase },
            other => other,
        }
    }
}

impl From<index::IndexError> for QueryError {
    fn from(err: index::IndexError) -> QueryError {
        QueryError::IndexFormat(err.to_string())
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, QueryError>;
