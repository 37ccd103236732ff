//! Decrypt-and-reconcile cycle.
//!
//! A reconciliation pass polls the on-chain ciphertext handles for one
//! instance, promotes pending grants the read path can now observe,
//! requests decryption for authorized handles, and publishes a fresh
//! immutable snapshot. Passes for the same instance are serialized against
//! each other; a pass that loses an epoch race (instance reselected or
//! session rebound while it was in flight) discards its snapshot instead of
//! publishing stale tallies.
//!
//! Decrypted values are append-only: once a plaintext has been observed for
//! a handle it is frozen, and a later pass reporting a different value for
//! the same handle is a backend inconsistency that gets logged and dropped,
//! never merged. Frozen values live as long as their instance stays
//! selected; deselecting releases them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::acl::GrantTracker;
use crate::encryption::{EncryptionContext, SessionWatch};
use crate::error::OrchestratorError;
use crate::ledger::{LedgerClient, translate_ledger_error};
use crate::model::{AuthorizationState, CiphertextHandle, HandleBytes, InstanceId, Principal};
use crate::read_model::{ReadModelCache, ReadModelSnapshot};

/// Drives reconciliation passes and owns the frozen-value store.
pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
    grants: Arc<GrantTracker>,
    cache: Arc<ReadModelCache>,
    pass_locks: StdMutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
    epoch: AtomicU64,
    frozen: StdMutex<HashMap<InstanceId, HashMap<HandleBytes, u64>>>,
}

impl Reconciler {
    /// Creates a reconciler over the given collaborators.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        grants: Arc<GrantTracker>,
        cache: Arc<ReadModelCache>,
    ) -> Self {
        Self {
            ledger,
            grants,
            cache,
            pass_locks: StdMutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            frozen: StdMutex::new(HashMap::new()),
        }
    }

    /// Invalidates every in-flight pass: snapshots built before the bump
    /// are discarded at publish time. Called on instance reselection and
    /// session rebind.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current epoch. A caller must read this *before* reading the
    /// selected instance and hand both to [`Self::reconcile`], so a pass
    /// queued across a reselection carries the pre-bump epoch and gets
    /// discarded instead of publishing a deselected instance's tallies.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Drops per-instance state for a deselected instance: its frozen
    /// values, and its pass lock when no pass still holds it.
    pub fn release_instance(&self, instance: InstanceId) {
        self.frozen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&instance);
        let mut locks = self
            .pass_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(lock) = locks.get(&instance) {
            // An in-flight pass keeps a clone; evicting then would let a
            // second pass for the same instance run beside it.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&instance);
            }
        }
    }

    fn pass_lock_for(&self, instance: InstanceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .pass_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(instance).or_default().clone()
    }

    fn frozen_value(&self, instance: InstanceId, bytes: HandleBytes) -> Option<u64> {
        self.frozen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&instance)
            .and_then(|values| values.get(&bytes))
            .copied()
    }

    /// Freezes `value` for `bytes`; a present value always wins.
    fn freeze(&self, instance: InstanceId, bytes: HandleBytes, value: u64) -> u64 {
        let mut frozen = self
            .frozen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let existing = *frozen
            .entry(instance)
            .or_default()
            .entry(bytes)
            .or_insert(value);
        if existing != value {
            warn!(
                handle = %bytes,
                frozen = existing,
                divergent = value,
                "backend reported a different plaintext for a frozen handle, keeping the frozen value"
            );
        }
        existing
    }

    /// Runs one reconciliation pass for `instance` and publishes the
    /// resulting snapshot unless the pass was invalidated while in flight.
    ///
    /// `epoch_at_start` is the epoch the caller observed when it read the
    /// selected instance, not the epoch at lock-acquisition time: a pass
    /// that queues behind the per-instance lock across a reselection must
    /// still lose the race.
    ///
    /// Returns the published snapshot, or `None` when the pass lost an
    /// epoch race and its result was discarded.
    ///
    /// # Errors
    ///
    /// `NetworkError` when a ledger read fails (callers running the
    /// background loop swallow and retry next cycle), `ContextStale` when
    /// the session moved under an in-flight decrypt request. Decrypt
    /// denials and backend transport failures are handled inside the pass
    /// and do not abort it.
    pub async fn reconcile(
        &self,
        ctx: &EncryptionContext,
        session: &SessionWatch,
        instance: InstanceId,
        epoch_at_start: u64,
        session_principals: &[Principal],
    ) -> Result<Option<Arc<ReadModelSnapshot>>, OrchestratorError> {
        // Serialize passes per instance; a second pass queues behind the
        // first rather than racing it for the frozen-value store.
        let pass_lock = self.pass_lock_for(instance);
        let _serialized = pass_lock.lock().await;

        if self.epoch.load(Ordering::SeqCst) != epoch_at_start {
            debug!(%instance, "pass invalidated while queued, skipping");
            return Ok(None);
        }
        debug!(%instance, epoch = epoch_at_start, "reconciliation pass starting");

        let raw_handles = self
            .ledger
            .handles(instance)
            .await
            .map_err(translate_ledger_error)?;
        let participant_count = self
            .ledger
            .submission_count(instance)
            .await
            .map_err(translate_ledger_error)?;
        let poll_info = match instance {
            InstanceId::Poll(poll_id) => Some(
                self.ledger
                    .poll_info(poll_id)
                    .await
                    .map_err(translate_ledger_error)?,
            ),
            InstanceId::SalaryPeriod(_) => None,
        };
        let hr_admin = match instance {
            InstanceId::SalaryPeriod(_) => Some(
                self.ledger
                    .hr_admin()
                    .await
                    .map_err(translate_ledger_error)?,
            ),
            InstanceId::Poll(_) => None,
        };

        // Promote pending grants the read path can now observe.
        if let Err(err) = self.grants.confirm_pending(self.ledger.as_ref()).await {
            if err.is_transient() {
                warn!(%instance, error = %err, "grant confirmation skipped this pass");
            } else {
                return Err(err);
            }
        }

        let mut handles: Vec<CiphertextHandle> = raw_handles
            .into_iter()
            .map(|(slot, bytes)| {
                let decrypted = if bytes.is_zero() {
                    // Never-written slot: plaintext zero without a request.
                    Some(0)
                } else {
                    self.frozen_value(instance, bytes)
                };
                CiphertextHandle {
                    instance,
                    slot,
                    bytes,
                    authorization: self.grants.effective_state(bytes, session_principals),
                    decrypted,
                }
            })
            .collect();
        handles.sort_by_key(|h| h.slot);

        let to_decrypt: Vec<HandleBytes> = handles
            .iter()
            .filter(|h| h.decrypted.is_none() && h.authorization == AuthorizationState::Authorized)
            .map(|h| h.bytes)
            .collect();

        if !to_decrypt.is_empty() {
            match ctx.request_decrypt(&session.binding(), &to_decrypt).await {
                Ok(values) => {
                    for handle in &mut handles {
                        if handle.decrypted.is_none() {
                            if let Some(value) = values.get(&handle.bytes) {
                                handle.decrypted =
                                    Some(self.freeze(instance, handle.bytes, *value));
                            }
                        }
                    }
                }
                Err(OrchestratorError::DecryptionDenied { handle }) => {
                    // The assumed grant was wrong or revoked; downgrade
                    // instead of retrying in a tight loop.
                    self.grants.downgrade(handle);
                    for h in &mut handles {
                        if h.bytes == handle {
                            h.authorization = AuthorizationState::Unauthorized;
                        }
                    }
                }
                Err(err @ OrchestratorError::DecryptionUnavailable { .. }) => {
                    warn!(%instance, error = %err, "decrypt request failed, leaving values absent");
                }
                Err(err) => return Err(err),
            }
        }

        let snapshot = Arc::new(ReadModelSnapshot {
            instance,
            poll_info,
            handles,
            participant_count,
            hr_admin,
            taken_at: Utc::now(),
        });

        if self.epoch.load(Ordering::SeqCst) != epoch_at_start {
            debug!(%instance, "pass invalidated while in flight, discarding snapshot");
            return Ok(None);
        }

        self.cache.publish(Arc::clone(&snapshot));
        debug!(%instance, participants = participant_count, "snapshot published");
        Ok(Some(snapshot))
    }
}
