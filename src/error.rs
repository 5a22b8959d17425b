//! Error types for the weft collector core.
//!
//! Only the narrow, recoverable surface of the collector returns errors:
//! configuration parsing and cycle admission. Anything that indicates a
//! corrupted heap invariant is fatal and panics with a diagnostic dump; those
//! invariants are global and there is nothing sensible to recover to.

use thiserror::Error;

/// Errors that can surface from the collector's public API.
#[derive(Debug, Clone, Error)]
pub enum GcError {
    /// A deadlock-policy string did not parse.
    #[error("unknown deadlock policy `{0}` (expected disabled, reclaim, or report)")]
    UnknownPolicy(String),
    /// The world could not be stopped because a fiber never reached a safe
    /// point.
    #[error("world not stopped: fiber {0} is still running")]
    WorldNotStopped(u64),
    /// A collection cycle was requested while another one was in progress.
    #[error("collection cycle already in progress")]
    CycleInProgress,
}

/// Result type for collector operations.
pub type GcResult<T> = Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_policy() {
        let err = GcError::UnknownPolicy("sometimes".to_string());
        assert!(err.to_string().contains("sometimes"));
    }
}
