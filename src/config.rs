//! Runtime-controlled collector configuration.
//!
//! The knobs here mirror the runtime's debug variables: the partial-deadlock
//! policy, the verbosity gate for structured reports, and the assertion gates
//! used by the scanners.

use std::str::FromStr;

use crate::error::GcError;

/// Policy applied when the marker finds a fiber in the `UNREACHABLE` state.
///
/// The polarity of the original detection flag was ambiguous; it is resolved
/// here by making the policy an explicit three-way configuration value rather
/// than a boolean with a negation.
///
/// # Examples
///
/// ```
/// use weftgc::config::DeadlockPolicy;
///
/// let policy: DeadlockPolicy = "reclaim".parse().unwrap();
/// assert!(policy.detecting());
/// assert!(!DeadlockPolicy::Disabled.detecting());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    /// No detection: every fiber is a valid root and nothing is tagged.
    Disabled,
    /// Detect and reclaim: unreachable fibers are dequeued from their wait
    /// structures and transitioned to `DEAD`.
    Reclaim,
    /// Detect and report: unreachable fibers transition to `DEADLOCKED` and
    /// are retained (their stacks are scanned as normal roots).
    Report,
}

impl DeadlockPolicy {
    /// Whether blocked fibers are classified and tagged at snapshot time.
    #[inline]
    pub fn detecting(self) -> bool {
        !matches!(self, DeadlockPolicy::Disabled)
    }
}

impl FromStr for DeadlockPolicy {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" | "0" => Ok(DeadlockPolicy::Disabled),
            "reclaim" | "1" => Ok(DeadlockPolicy::Reclaim),
            "report" | "2" => Ok(DeadlockPolicy::Report),
            other => Err(GcError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Collector configuration, fixed for the lifetime of a context.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Partial-deadlock detection policy.
    pub deadlock_policy: DeadlockPolicy,
    /// Verbosity gate for the structured deadlock-detection reports (0, 1, 2).
    pub ddtrace: u8,
    /// Extra mark-phase assertions (marking a free object becomes fatal with a
    /// dump instead of silent corruption).
    pub check_mark: bool,
    /// Log every conservatively scanned block.
    pub debug_scan_conservative: bool,
    /// Log stack-object discovery during stack scans.
    pub stack_trace_debug: bool,
}

impl GcConfig {
    /// Verbosity check for deadlock-detection trace output.
    #[inline]
    pub fn ddtrace(&self, level: u8) -> bool {
        self.ddtrace == level
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            deadlock_policy: DeadlockPolicy::Disabled,
            ddtrace: 0,
            check_mark: false,
            debug_scan_conservative: false,
            stack_trace_debug: false,
        }
    }
}
