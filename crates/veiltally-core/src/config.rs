//! Externally supplied orchestrator parameters.

use std::time::Duration;

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a success message stays visible before auto-dismissal.
pub const DEFAULT_SUCCESS_MESSAGE_TTL: Duration = Duration::from_secs(3);

/// Default time an error message stays visible before auto-dismissal.
pub const DEFAULT_ERROR_MESSAGE_TTL: Duration = Duration::from_secs(5);

/// Upper bound on a single salary submission.
pub const DEFAULT_MAX_SALARY: u64 = 10_000_000;

/// Tunable parameters for one orchestrator session.
///
/// The resubmission cooldown is an external contract parameter; it is
/// carried here only so a surfaced [`RateLimited`] error can report the
/// window to the caller. The orchestrator never sleeps or retries on it.
///
/// [`RateLimited`]: crate::error::OrchestratorError::RateLimited
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between background reconciliation passes.
    pub reconcile_interval: Duration,
    /// Contract-defined resubmission cooldown, when known.
    pub resubmission_cooldown: Option<Duration>,
    /// How long success messages stay visible.
    pub success_message_ttl: Duration,
    /// How long error messages stay visible.
    pub error_message_ttl: Duration,
    /// Upper bound on a single salary submission.
    pub max_salary: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            resubmission_cooldown: None,
            success_message_ttl: DEFAULT_SUCCESS_MESSAGE_TTL,
            error_message_ttl: DEFAULT_ERROR_MESSAGE_TTL,
            max_salary: DEFAULT_MAX_SALARY,
        }
    }
}
