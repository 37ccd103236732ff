//! Access-control workflow for per-handle decryption grants.
//!
//! [`GrantTracker`] is the local mirror of on-chain grant state. Each
//! `(handle, principal)` pair moves through the state machine
//! `Unauthorized → AuthorizationPending → Authorized`: a confirmed grant
//! transaction puts the pair into `AuthorizationPending`, and only the read
//! path observing the grant on-chain promotes it to `Authorized`. The
//! reconcile cycle must not request decryption for pending handles; the
//! gap exists because the underlying ledger is eventually consistent
//! between a confirmed write and the read path.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::ledger::{LedgerClient, translate_ledger_error};
use crate::model::{Address, AuthorizationState, HandleBytes, Principal, TxReceipt};

#[derive(Debug, Clone)]
struct GrantRecord {
    state: AuthorizationState,
    granted_at: DateTime<Utc>,
    receipt: Option<TxReceipt>,
}

/// Local mirror of per-handle decryption grants.
///
/// The tracker is the single place grant state lives; the read model copies
/// it into snapshots but never maintains its own flag set that could drift
/// from on-chain truth.
#[derive(Debug, Default)]
pub struct GrantTracker {
    records: Mutex<HashMap<(HandleBytes, Principal), GrantRecord>>,
}

impl GrantTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(HandleBytes, Principal), GrantRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Authorization state for one `(handle, principal)` pair.
    #[must_use]
    pub fn state(&self, handle: HandleBytes, principal: Principal) -> AuthorizationState {
        self.lock()
            .get(&(handle, principal))
            .map_or(AuthorizationState::Unauthorized, |r| r.state)
    }

    /// Strongest authorization state for `handle` across the session's
    /// principals. Public grants always count.
    #[must_use]
    pub fn effective_state(
        &self,
        handle: HandleBytes,
        session_principals: &[Principal],
    ) -> AuthorizationState {
        let records = self.lock();
        let mut best = AuthorizationState::Unauthorized;
        for principal in session_principals.iter().chain([&Principal::Public]) {
            if let Some(record) = records.get(&(handle, *principal)) {
                best = best.max(record.state);
            }
        }
        best
    }

    /// Submits a grant-decrypt transaction for `(handle, principal)`.
    ///
    /// The local cache is checked first: a live grant (pending or
    /// authorized) fails with `AlreadyGranted` without submitting a second
    /// transaction. The pair is reserved before the transaction goes out so
    /// a concurrent caller cannot double-submit either.
    ///
    /// # Errors
    ///
    /// `AlreadyGranted` on a live duplicate; translated ledger errors
    /// otherwise.
    pub async fn submit_grant(
        &self,
        ledger: &dyn LedgerClient,
        grantor: Address,
        handle: HandleBytes,
        principal: Principal,
    ) -> Result<TxReceipt, OrchestratorError> {
        {
            let mut records = self.lock();
            if let Some(record) = records.get(&(handle, principal)) {
                if record.state > AuthorizationState::Unauthorized {
                    return Err(OrchestratorError::AlreadyGranted);
                }
            }
            // Reserve the pair; removed again if the transaction fails.
            records.insert(
                (handle, principal),
                GrantRecord {
                    state: AuthorizationState::AuthorizationPending,
                    granted_at: Utc::now(),
                    receipt: None,
                },
            );
        }

        match ledger.submit_grant(grantor, handle, principal).await {
            Ok(receipt) => {
                debug!(%handle, %principal, tx = %receipt.tx_hash, "grant transaction confirmed");
                let mut records = self.lock();
                if let Some(record) = records.get_mut(&(handle, principal)) {
                    record.granted_at = receipt.confirmed_at;
                    record.receipt = Some(receipt.clone());
                }
                Ok(receipt)
            }
            Err(err) => {
                self.lock().remove(&(handle, principal));
                Err(translate_ledger_error(err))
            }
        }
    }

    /// Promotes pending pairs whose grants are now observable on-chain.
    ///
    /// # Errors
    ///
    /// Propagates translated ledger errors; the caller (a reconcile pass)
    /// decides whether to swallow them.
    pub async fn confirm_pending(&self, ledger: &dyn LedgerClient) -> Result<(), OrchestratorError> {
        let pending: Vec<(HandleBytes, Principal)> = self
            .lock()
            .iter()
            .filter(|(_, r)| r.state == AuthorizationState::AuthorizationPending)
            .map(|(k, _)| *k)
            .collect();

        for (handle, principal) in pending {
            let confirmed = ledger
                .grant_confirmed(handle, principal)
                .await
                .map_err(translate_ledger_error)?;
            if confirmed {
                let mut records = self.lock();
                if let Some(record) = records.get_mut(&(handle, principal)) {
                    if record.state == AuthorizationState::AuthorizationPending {
                        record.state = AuthorizationState::Authorized;
                        debug!(%handle, %principal, "grant observed on-chain, handle authorized");
                    }
                }
            }
        }
        Ok(())
    }

    /// Downgrades every record for `handle` to `Unauthorized`.
    ///
    /// Called when a decrypt request is denied: the assumed grant was wrong
    /// or has been revoked, and retrying in a tight loop would be wrong.
    pub fn downgrade(&self, handle: HandleBytes) {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|(h, _), _| *h != handle);
        if records.len() != before {
            warn!(%handle, "decryption denied, downgrading local grant state");
        }
    }
}
