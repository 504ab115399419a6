//! Core error types for Weft.

use std::fmt;

use thiserror::Error;

/// Result type alias using `QueryError`.
pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Which token caused a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelSource {
    /// The caller-supplied token fired.
    External,
    /// The engine cancelled the query itself (worker fault or early disposal).
    Internal,
}

impl fmt::Display for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => write!(f, "external token"),
            Self::Internal => write!(f, "internal token"),
        }
    }
}

/// Core error type for query execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// The query observed a cancelled token.
    #[error("Canceled: query canceled by {0}")]
    Canceled(CancelSource),

    /// A worker task failed (user callback panicked or returned an error).
    #[error("Faulted: {0}")]
    Faulted(String),

    /// One or more worker faults, surfaced after the whole task group joined.
    #[error("AggregateError: {} worker error(s): {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<QueryError>),

    /// A component broke its contract (wrong partition count, misuse of state).
    #[error("ContractViolation: {0}")]
    ContractViolation(String),

    /// The operation is not valid for the data (e.g. empty sequence with no seed).
    #[error("InvalidOperation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration value.
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),

    /// Internal error (bug in Weft).
    #[error("InternalError: {0}")]
    InternalError(String),
}

fn join_messages(errors: &[QueryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl QueryError {
    /// Create a new `Canceled` error.
    pub const fn canceled(source: CancelSource) -> Self {
        Self::Canceled(source)
    }

    /// Create a new `Faulted` error.
    pub fn faulted<S: Into<String>>(msg: S) -> Self {
        Self::Faulted(msg.into())
    }

    /// Create a new `ContractViolation` error.
    pub fn contract_violation<S: Into<String>>(msg: S) -> Self {
        Self::ContractViolation(msg.into())
    }

    /// Create a new `InvalidOperation` error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a new `InvalidParameter` error.
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a new `InternalError`.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalError(msg.into())
    }

    /// The error raised by terminal operators on an empty input.
    pub fn no_elements() -> Self {
        Self::InvalidOperation("sequence contains no elements".to_string())
    }

    /// Whether this is a cancellation of any source.
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// Whether this is a cancellation raised by the caller's token.
    pub const fn is_external_cancel(&self) -> bool {
        matches!(self, Self::Canceled(CancelSource::External))
    }

    /// Inner errors of an aggregate, or a single-element slice of `self`.
    pub fn inner_errors(&self) -> &[QueryError] {
        match self {
            Self::Aggregate(inner) => inner,
            other => std::slice::from_ref(other),
        }
    }
}

/// Return early with a `ContractViolation` unless the condition holds.
#[macro_export]
macro_rules! ensure_contract {
    ($cond:expr, $($msg:tt)*) => {
        if !$cond {
            return Err($crate::QueryError::ContractViolation(format!($($msg)*)));
        }
    };
}

/// Return early with an `InvalidOperation`.
#[macro_export]
macro_rules! invalid_op {
    ($($arg:tt)*) => {
        return Err($crate::QueryError::InvalidOperation(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_partitions(count: usize, expected: usize) -> QueryResult<()> {
        ensure_contract!(
            count == expected,
            "partitioner returned {count} partitions, expected {expected}"
        );
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = QueryError::canceled(CancelSource::External);
        assert_eq!(err.to_string(), "Canceled: query canceled by external token");

        let err = QueryError::faulted("boom");
        assert_eq!(err.to_string(), "Faulted: boom");
    }

    #[test]
    fn test_aggregate_display() {
        let err = QueryError::Aggregate(vec![
            QueryError::faulted("first"),
            QueryError::faulted("second"),
        ]);
        assert_eq!(
            err.to_string(),
            "AggregateError: 2 worker error(s): Faulted: first; Faulted: second"
        );
        assert_eq!(err.inner_errors().len(), 2);
    }

    #[test]
    fn test_cancel_predicates() {
        assert!(QueryError::canceled(CancelSource::Internal).is_canceled());
        assert!(!QueryError::canceled(CancelSource::Internal).is_external_cancel());
        assert!(QueryError::canceled(CancelSource::External).is_external_cancel());
        assert!(!QueryError::no_elements().is_canceled());
    }

    #[test]
    fn test_ensure_contract_macro() {
        assert!(check_partitions(4, 4).is_ok());
        let err = check_partitions(3, 4).unwrap_err();
        assert!(matches!(err, QueryError::ContractViolation(_)));
        assert!(err.to_string().contains("returned 3 partitions"));
    }
}
