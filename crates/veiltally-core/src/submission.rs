//! Idempotent submission pipeline.
//!
//! Turns a validated plaintext into a ciphertext-plus-proof, submits it as
//! a transaction, and guarantees at most one in-flight submission per
//! `(subject, instance)` pair. Validation runs before any network call;
//! the in-flight guard trips immediately (no queuing) on a re-entrant or
//! double-clicked submission; the guard entry is released on every exit
//! path by an RAII drop guard.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::encryption::{EncryptionContext, SessionWatch};
use crate::error::OrchestratorError;
use crate::ledger::{LedgerClient, translate_ledger_error};
use crate::model::{Address, InstanceId, TxReceipt};

/// A plaintext that passed domain validation, ready to encrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedInput {
    /// The value to encrypt.
    pub value: u64,
    /// The slot the ciphertext targets (0 for the salary sum, the option
    /// index for votes).
    pub slot: u32,
    /// The contract field the ciphertext is bound to.
    pub field: &'static str,
}

/// Validates a raw salary amount: finite, strictly positive, at most
/// `max_salary`, floored to an integer.
///
/// # Errors
///
/// `ValidationError` describing the rejected input.
pub fn validate_salary(raw: f64, max_salary: u64) -> Result<ValidatedInput, OrchestratorError> {
    if !raw.is_finite() || raw <= 0.0 {
        return Err(OrchestratorError::validation(
            "salary must be a positive amount",
        ));
    }
    #[allow(clippy::cast_precision_loss)]
    if raw > max_salary as f64 {
        return Err(OrchestratorError::validation(format!(
            "salary exceeds the maximum of {max_salary}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = raw.floor() as u64;
    if value == 0 {
        return Err(OrchestratorError::validation(
            "salary must be at least 1 after rounding down",
        ));
    }
    Ok(ValidatedInput {
        value,
        slot: 0,
        field: "salary",
    })
}

/// Validates a vote option index against the poll's option count.
///
/// # Errors
///
/// `InvalidOption` when the index is out of range. Fails before any
/// transaction is sent.
pub fn validate_vote(
    option_index: u32,
    option_count: u32,
) -> Result<ValidatedInput, OrchestratorError> {
    if option_index >= option_count {
        return Err(OrchestratorError::invalid_option(format!(
            "index {option_index} out of range ({option_count} options)"
        )));
    }
    Ok(ValidatedInput {
        value: u64::from(option_index),
        slot: option_index,
        field: "vote",
    })
}

/// The idempotent submission pipeline.
pub struct SubmissionPipeline {
    in_flight: Mutex<HashSet<(Address, InstanceId)>>,
}

impl Default for SubmissionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionPipeline {
    /// Creates a pipeline with no submissions in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` if a submission for the pair is currently in flight.
    #[must_use]
    pub fn is_in_flight(&self, subject: Address, instance: InstanceId) -> bool {
        self.guard_set().contains(&(subject, instance))
    }

    fn guard_set(&self) -> std::sync::MutexGuard<'_, HashSet<(Address, InstanceId)>> {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Encrypts `input` and submits it for `subject` into `instance`.
    ///
    /// Once the transaction has been broadcast the operation is not
    /// cancellable; only completion ends it. There is no internal retry on
    /// any contract rejection: duplicates and closed windows are final, and
    /// `RateLimited` is surfaced with the configured cooldown for the
    /// caller to schedule.
    ///
    /// # Errors
    ///
    /// `SubmissionInProgress` when the pair already has an in-flight
    /// submission; `ContextStale` when the session was rebound between the
    /// start of the operation and the encrypt call; `EncryptionFailed` from
    /// the encryption path; translated contract rejections or
    /// `NetworkError` from the ledger (surfaced immediately, never
    /// swallowed).
    pub async fn submit(
        &self,
        ledger: &dyn LedgerClient,
        ctx: &EncryptionContext,
        session: &SessionWatch,
        config: &OrchestratorConfig,
        subject: Address,
        instance: InstanceId,
        contract: Address,
        input: ValidatedInput,
    ) -> Result<TxReceipt, OrchestratorError> {
        let _guard = self.acquire(subject, instance)?;
        debug!(%subject, %instance, slot = input.slot, "starting encrypted submission");

        let payload = ctx
            .encrypt(&session.binding(), contract, input.field, input.value)
            .await?;

        match ledger
            .submit_ciphertext(subject, instance, input.slot, &payload)
            .await
        {
            Ok(receipt) => {
                info!(%subject, %instance, tx = %receipt.tx_hash, "submission confirmed");
                Ok(receipt)
            }
            Err(err) => {
                let translated = match translate_ledger_error(err) {
                    OrchestratorError::RateLimited { .. } => OrchestratorError::RateLimited {
                        cooldown_secs: config.resubmission_cooldown.map(|d| d.as_secs()),
                    },
                    other => other,
                };
                warn!(%subject, %instance, error = %translated, "submission rejected");
                Err(translated)
            }
        }
    }

    fn acquire(
        &self,
        subject: Address,
        instance: InstanceId,
    ) -> Result<InFlightGuard<'_>, OrchestratorError> {
        let mut set = self.guard_set();
        if !set.insert((subject, instance)) {
            return Err(OrchestratorError::SubmissionInProgress { subject, instance });
        }
        Ok(InFlightGuard {
            pipeline: self,
            key: (subject, instance),
        })
    }
}

/// Releases the in-flight entry on drop, success or failure alike.
struct InFlightGuard<'a> {
    pipeline: &'a SubmissionPipeline,
    key: (Address, InstanceId),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.guard_set().remove(&self.key);
    }
}
