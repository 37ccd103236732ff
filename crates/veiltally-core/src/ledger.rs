//! Ledger/contract collaborator seam and revert translation.
//!
//! The smart contract is an external system reached only through the
//! [`LedgerClient`] trait: reads for instance metadata and ciphertext
//! handles, writes for encrypted submissions and decryption grants.
//!
//! Raw revert data never crosses this module uninterpreted:
//! [`translate_ledger_error`] maps known revert reasons into the typed
//! taxonomy and collapses everything else into a generic, presentation-safe
//! rejection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::encryption::CiphertextWithProof;
use crate::error::OrchestratorError;
use crate::model::{Address, HandleBytes, InstanceId, PollInfo, Principal, TxReceipt};

/// Failures reported by a ledger client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// The contract reverted the transaction.
    #[error("transaction reverted: {reason}")]
    Reverted {
        /// The raw revert reason as reported by the node.
        reason: String,
    },
    /// The node could not be reached or the call timed out.
    #[error("ledger transport failure: {reason}")]
    Transport {
        /// Transport-level detail.
        reason: String,
    },
}

/// Read/write access to the aggregation contracts.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submits an encrypted value for `subject` into `instance` at `slot`
    /// (slot 0 for the salary sum, the option index for votes).
    async fn submit_ciphertext(
        &self,
        subject: Address,
        instance: InstanceId,
        slot: u32,
        payload: &CiphertextWithProof,
    ) -> Result<TxReceipt, LedgerError>;

    /// Submits a grant-decrypt transaction for `(handle, principal)` signed
    /// by `grantor`.
    async fn submit_grant(
        &self,
        grantor: Address,
        handle: HandleBytes,
        principal: Principal,
    ) -> Result<TxReceipt, LedgerError>;

    /// Creates a poll and returns its ordinal id.
    async fn create_poll(
        &self,
        creator: Address,
        title: &str,
        description: &str,
        options: &[String],
        ends_at: DateTime<Utc>,
    ) -> Result<(u32, TxReceipt), LedgerError>;

    /// Number of polls created so far.
    async fn poll_count(&self) -> Result<u32, LedgerError>;

    /// Metadata for one poll.
    async fn poll_info(&self, poll_id: u32) -> Result<PollInfo, LedgerError>;

    /// Ordinal of the currently open salary period.
    async fn current_salary_period(&self) -> Result<u64, LedgerError>;

    /// Ciphertext handles for an instance as `(slot, bytes)` pairs: the
    /// single sum handle for a salary period, one handle per option for a
    /// poll. Never-written slots report [`HandleBytes::ZERO`].
    async fn handles(&self, instance: InstanceId) -> Result<Vec<(u32, HandleBytes)>, LedgerError>;

    /// Number of successful submissions into an instance.
    async fn submission_count(&self, instance: InstanceId) -> Result<u64, LedgerError>;

    /// Whether `subject` already submitted into `instance`.
    async fn has_submitted(
        &self,
        subject: Address,
        instance: InstanceId,
    ) -> Result<bool, LedgerError>;

    /// Whether a grant for `(handle, principal)` is observable on-chain.
    async fn grant_confirmed(
        &self,
        handle: HandleBytes,
        principal: Principal,
    ) -> Result<bool, LedgerError>;

    /// The HR admin account of the salary aggregator.
    async fn hr_admin(&self) -> Result<Address, LedgerError>;
}

/// Translates a ledger failure into the orchestrator taxonomy.
///
/// Matching is substring-based over the revert reason, case-insensitive,
/// mirroring the reasons the aggregation contracts actually emit. Unknown
/// reverts become [`OrchestratorError::ContractRejected`] with a generic
/// message; the raw string is logged, not surfaced.
#[must_use]
pub fn translate_ledger_error(err: LedgerError) -> OrchestratorError {
    match err {
        LedgerError::Transport { reason } => OrchestratorError::NetworkError { reason },
        LedgerError::Reverted { reason } => {
            let lowered = reason.to_lowercase();
            if lowered.contains("already submitted") || lowered.contains("already voted") {
                OrchestratorError::AlreadySubmitted
            } else if lowered.contains("rate limit") {
                OrchestratorError::RateLimited {
                    cooldown_secs: None,
                }
            } else if lowered.contains("poll not active") || lowered.contains("voting ended") {
                OrchestratorError::PollNotActive
            } else if lowered.contains("invalid option") {
                OrchestratorError::invalid_option("rejected by contract")
            } else if lowered.contains("not authorized") || lowered.contains("only hr") {
                OrchestratorError::unauthorized("rejected by contract")
            } else {
                tracing::debug!(revert = %reason, "untranslated contract revert");
                OrchestratorError::contract_rejected("the contract refused the transaction")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A ledger whose every call fails with a transport error. Lets unit
    /// tests construct components without wiring a working chain double.
    pub(crate) struct UnreachableLedger;

    fn unreachable<T>() -> Result<T, LedgerError> {
        Err(LedgerError::Transport {
            reason: "unreachable test ledger".to_owned(),
        })
    }

    #[async_trait]
    impl LedgerClient for UnreachableLedger {
        async fn submit_ciphertext(
            &self,
            _subject: Address,
            _instance: InstanceId,
            _slot: u32,
            _payload: &CiphertextWithProof,
        ) -> Result<TxReceipt, LedgerError> {
            unreachable()
        }

        async fn submit_grant(
            &self,
            _grantor: Address,
            _handle: HandleBytes,
            _principal: Principal,
        ) -> Result<TxReceipt, LedgerError> {
            unreachable()
        }

        async fn create_poll(
            &self,
            _creator: Address,
            _title: &str,
            _description: &str,
            _options: &[String],
            _ends_at: DateTime<Utc>,
        ) -> Result<(u32, TxReceipt), LedgerError> {
            unreachable()
        }

        async fn poll_count(&self) -> Result<u32, LedgerError> {
            unreachable()
        }

        async fn poll_info(&self, _poll_id: u32) -> Result<PollInfo, LedgerError> {
            unreachable()
        }

        async fn current_salary_period(&self) -> Result<u64, LedgerError> {
            unreachable()
        }

        async fn handles(
            &self,
            _instance: InstanceId,
        ) -> Result<Vec<(u32, HandleBytes)>, LedgerError> {
            unreachable()
        }

        async fn submission_count(&self, _instance: InstanceId) -> Result<u64, LedgerError> {
            unreachable()
        }

        async fn has_submitted(
            &self,
            _subject: Address,
            _instance: InstanceId,
        ) -> Result<bool, LedgerError> {
            unreachable()
        }

        async fn grant_confirmed(
            &self,
            _handle: HandleBytes,
            _principal: Principal,
        ) -> Result<bool, LedgerError> {
            unreachable()
        }

        async fn hr_admin(&self) -> Result<Address, LedgerError> {
            unreachable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revert(reason: &str) -> LedgerError {
        LedgerError::Reverted {
            reason: reason.to_owned(),
        }
    }

    #[test]
    fn translates_duplicate_submissions() {
        assert_eq!(
            translate_ledger_error(revert("Salary already submitted this period")),
            OrchestratorError::AlreadySubmitted
        );
        assert_eq!(
            translate_ledger_error(revert("Already voted")),
            OrchestratorError::AlreadySubmitted
        );
    }

    #[test]
    fn translates_rate_limit_and_window() {
        assert_eq!(
            translate_ledger_error(revert("Rate limit: wait before resubmitting")),
            OrchestratorError::RateLimited {
                cooldown_secs: None
            }
        );
        assert_eq!(
            translate_ledger_error(revert("Poll not active")),
            OrchestratorError::PollNotActive
        );
    }

    #[test]
    fn translates_invalid_option_and_authorization() {
        assert!(matches!(
            translate_ledger_error(revert("Invalid option index")),
            OrchestratorError::InvalidOption { .. }
        ));
        assert!(matches!(
            translate_ledger_error(revert("Only HR can do this")),
            OrchestratorError::Unauthorized { .. }
        ));
    }

    #[test]
    fn unknown_revert_does_not_leak_raw_string() {
        let err = translate_ledger_error(revert("PANIC 0xdeadbeef internal slot 12"));
        match err {
            OrchestratorError::ContractRejected { reason } => {
                assert!(!reason.contains("0xdeadbeef"));
            }
            other => panic!("expected ContractRejected, got {other:?}"),
        }
    }

    #[test]
    fn transport_is_network_error() {
        assert!(matches!(
            translate_ledger_error(LedgerError::Transport {
                reason: "connection refused".into()
            }),
            OrchestratorError::NetworkError { .. }
        ));
    }
}
