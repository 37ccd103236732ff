//! Command/query facade over the orchestrator components.
//!
//! The presentation layer talks only to [`Orchestrator`]: commands
//! (`submit_salary`, `cast_vote`, `create_poll`, the grant operations,
//! `decrypt`, the refresh operations) and queries over the latest read-model
//! snapshot. The facade owns one explicitly rebindable encryption context —
//! never ambient global state — so a chain or account switch invalidates
//! in-flight work instead of silently corrupting it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acl::GrantTracker;
use crate::config::OrchestratorConfig;
use crate::encryption::{EncryptionBackend, EncryptionContext, SessionWatch};
use crate::error::OrchestratorError;
use crate::ledger::{LedgerClient, translate_ledger_error};
use crate::model::{
    Address, HandleBytes, InstanceId, PollInfo, Principal, SessionBinding, TxReceipt,
    MAX_POLL_OPTIONS, MIN_POLL_OPTIONS,
};
use crate::read_model::{ReadModelCache, ReadModelSnapshot};
use crate::reconcile::Reconciler;
use crate::submission::{SubmissionPipeline, validate_salary, validate_vote};
use crate::task::{self, CancelToken};

/// The confidential-submission and threshold-decryption orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Arc<dyn EncryptionBackend>,
    ledger: Arc<dyn LedgerClient>,
    contract: Address,
    session: SessionWatch,
    pipeline: SubmissionPipeline,
    grants: Arc<GrantTracker>,
    reconciler: Reconciler,
    cache: Arc<ReadModelCache>,
    selected: StdMutex<Option<InstanceId>>,
    dismiss_token: StdMutex<Option<CancelToken>>,
}

impl Orchestrator {
    /// Builds an orchestrator bound to `(chain_id, signer)`.
    ///
    /// # Errors
    ///
    /// `ContextUnavailable` when the backend has no support for the chain.
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn EncryptionBackend>,
        ledger: Arc<dyn LedgerClient>,
        contract: Address,
        chain_id: u64,
        signer: Address,
    ) -> Result<Self, OrchestratorError> {
        let session = SessionWatch::new(EncryptionContext::bind(
            Arc::clone(&backend),
            chain_id,
            signer,
        )?);
        let grants = Arc::new(GrantTracker::new());
        let cache = Arc::new(ReadModelCache::new());
        let reconciler = Reconciler::new(
            Arc::clone(&ledger),
            Arc::clone(&grants),
            Arc::clone(&cache),
        );
        Ok(Self {
            config,
            backend,
            ledger,
            contract,
            session,
            pipeline: SubmissionPipeline::new(),
            grants,
            reconciler,
            cache,
            selected: StdMutex::new(None),
            dismiss_token: StdMutex::new(None),
        })
    }

    // -------------------------------------------------------------------
    // Session management
    // -------------------------------------------------------------------

    /// Re-derives the encryption context for a new chain or signer.
    ///
    /// In-flight operations holding the previous context fail with
    /// `ContextStale` at their next use; in-flight reconciliation passes
    /// are invalidated and discard their snapshots.
    ///
    /// # Errors
    ///
    /// `ContextUnavailable` when the backend has no support for the chain.
    pub fn rebind_session(&self, chain_id: u64, signer: Address) -> Result<(), OrchestratorError> {
        let fresh = EncryptionContext::bind(Arc::clone(&self.backend), chain_id, signer)?;
        self.session.replace(fresh);
        self.reconciler.bump_epoch();
        info!(chain_id, %signer, "session rebound");
        Ok(())
    }

    fn current_context(&self) -> EncryptionContext {
        self.session.context()
    }

    /// The session binding operations are currently validated against.
    #[must_use]
    pub fn current_binding(&self) -> SessionBinding {
        self.session.binding()
    }

    async fn session_principals(&self) -> Vec<Principal> {
        let signer = self.current_binding().signer;
        let mut principals = vec![Principal::Account(signer)];
        if let Ok(hr) = self.ledger.hr_admin().await {
            if hr == signer {
                principals.push(Principal::Hr);
            }
        }
        principals
    }

    // -------------------------------------------------------------------
    // Instance selection
    // -------------------------------------------------------------------

    /// Selects the aggregation instance the read model follows.
    ///
    /// The previous snapshot is invalidated, not merged, and any in-flight
    /// reconciliation pass for the previous instance is cancelled: its late
    /// results are discarded so one instance's tallies can never show under
    /// another's id.
    pub fn select_instance(&self, instance: Option<InstanceId>) {
        let previous = {
            let mut selected = self
                .selected
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *selected == instance {
                return;
            }
            std::mem::replace(&mut *selected, instance)
        };
        self.reconciler.bump_epoch();
        if let Some(previous) = previous {
            self.reconciler.release_instance(previous);
        }
        self.cache.invalidate();
        debug!(instance = ?instance, "instance selected, previous snapshot invalidated");
    }

    /// Selects a poll by ordinal id, or clears the selection.
    pub fn select_poll(&self, poll_id: Option<u32>) {
        self.select_instance(poll_id.map(InstanceId::Poll));
    }

    /// Looks up the open salary period and selects it.
    ///
    /// # Errors
    ///
    /// Translated ledger errors from the period lookup.
    pub async fn select_current_salary_period(&self) -> Result<InstanceId, OrchestratorError> {
        let period = self
            .ledger
            .current_salary_period()
            .await
            .map_err(translate_ledger_error)?;
        let instance = InstanceId::SalaryPeriod(period);
        self.select_instance(Some(instance));
        Ok(instance)
    }

    /// The currently selected instance.
    #[must_use]
    pub fn selected_instance(&self) -> Option<InstanceId> {
        *self
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------

    /// Validates and submits the signer's salary for the open period.
    ///
    /// # Errors
    ///
    /// `ValidationError` before any network call; `SubmissionInProgress`
    /// on a re-entrant submission; translated contract rejections
    /// (`AlreadySubmitted`, `RateLimited`) or `NetworkError` otherwise.
    pub async fn submit_salary(&self, raw: f64) -> Result<TxReceipt, OrchestratorError> {
        let result = self.submit_salary_inner(raw).await;
        match &result {
            Ok(_) => self.note_success("Salary submitted successfully"),
            Err(err) => self.note_error(err.to_string()),
        }
        result
    }

    async fn submit_salary_inner(&self, raw: f64) -> Result<TxReceipt, OrchestratorError> {
        let input = validate_salary(raw, self.config.max_salary)?;
        let _processing = self.begin_processing();
        let period = self
            .ledger
            .current_salary_period()
            .await
            .map_err(translate_ledger_error)?;
        let instance = InstanceId::SalaryPeriod(period);
        let ctx = self.current_context();
        self.pipeline
            .submit(
                self.ledger.as_ref(),
                &ctx,
                &self.session,
                &self.config,
                ctx.binding().signer,
                instance,
                self.contract,
                input,
            )
            .await
    }

    /// Validates and casts an encrypted vote.
    ///
    /// The option index is checked against the poll's option count before
    /// any transaction is sent.
    ///
    /// # Errors
    ///
    /// `InvalidOption` locally; `SubmissionInProgress` on a re-entrant
    /// vote; translated contract rejections (`AlreadySubmitted`,
    /// `PollNotActive`) or `NetworkError` otherwise.
    pub async fn cast_vote(
        &self,
        poll_id: u32,
        option_index: u32,
    ) -> Result<TxReceipt, OrchestratorError> {
        let result = self.cast_vote_inner(poll_id, option_index).await;
        match &result {
            Ok(_) => self.note_success("Vote cast successfully"),
            Err(err) => self.note_error(err.to_string()),
        }
        result
    }

    async fn cast_vote_inner(
        &self,
        poll_id: u32,
        option_index: u32,
    ) -> Result<TxReceipt, OrchestratorError> {
        let _processing = self.begin_processing();
        let instance = InstanceId::Poll(poll_id);
        let info = self.poll_info_for(poll_id).await?;
        let input = validate_vote(option_index, info.option_count())?;
        let ctx = self.current_context();
        self.pipeline
            .submit(
                self.ledger.as_ref(),
                &ctx,
                &self.session,
                &self.config,
                ctx.binding().signer,
                instance,
                self.contract,
                input,
            )
            .await
    }

    /// Creates a poll from a title, optional description, option labels,
    /// and an end time.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an empty title or fewer than two (or more
    /// than ten) non-empty options; translated ledger errors otherwise.
    pub async fn create_poll(
        &self,
        title: &str,
        description: &str,
        options: &[String],
        ends_at: DateTime<Utc>,
    ) -> Result<(u32, TxReceipt), OrchestratorError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(OrchestratorError::validation("poll title must not be empty"));
        }
        let options: Vec<String> = options
            .iter()
            .map(|o| o.trim().to_owned())
            .filter(|o| !o.is_empty())
            .collect();
        if options.len() < MIN_POLL_OPTIONS {
            return Err(OrchestratorError::validation(format!(
                "a poll needs at least {MIN_POLL_OPTIONS} options"
            )));
        }
        if options.len() > MAX_POLL_OPTIONS {
            return Err(OrchestratorError::validation(format!(
                "a poll may have at most {MAX_POLL_OPTIONS} options"
            )));
        }

        let _processing = self.begin_processing();
        let creator = self.current_binding().signer;
        let (poll_id, receipt) = self
            .ledger
            .create_poll(creator, title, description.trim(), &options, ends_at)
            .await
            .map_err(translate_ledger_error)?;
        info!(poll_id, %creator, "poll created");
        self.note_success("Poll created successfully");
        Ok((poll_id, receipt))
    }

    /// Authorizes the HR admin to decrypt the current period's sum handle.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when the signer is not the HR admin; `AlreadyGranted`
    /// on a live duplicate; translated ledger errors otherwise.
    pub async fn allow_hr_to_decrypt_sum(&self) -> Result<TxReceipt, OrchestratorError> {
        let _processing = self.begin_processing();
        let current = self.current_binding();
        let hr = self
            .ledger
            .hr_admin()
            .await
            .map_err(translate_ledger_error)?;
        if current.signer != hr {
            return Err(OrchestratorError::unauthorized(
                "only the HR admin can authorize sum decryption",
            ));
        }
        let period = self
            .ledger
            .current_salary_period()
            .await
            .map_err(translate_ledger_error)?;
        let handle = self
            .handle_for(InstanceId::SalaryPeriod(period), 0)
            .await?;
        if handle.is_zero() {
            return Err(OrchestratorError::validation(
                "no salaries submitted this period yet",
            ));
        }
        self.grants
            .submit_grant(self.ledger.as_ref(), current.signer, handle, Principal::Hr)
            .await
    }

    /// Authorizes public decryption of one poll option's tally handle.
    ///
    /// # Errors
    ///
    /// `InvalidOption` for an out-of-range option; `AlreadyGranted` on a
    /// live duplicate; translated ledger errors otherwise.
    pub async fn allow_admin_to_decrypt(
        &self,
        poll_id: u32,
        option_index: u32,
    ) -> Result<TxReceipt, OrchestratorError> {
        let _processing = self.begin_processing();
        let info = self.poll_info_for(poll_id).await?;
        if option_index >= info.option_count() {
            return Err(OrchestratorError::invalid_option(format!(
                "index {option_index} out of range ({} options)",
                info.option_count()
            )));
        }
        let handle = self
            .handle_for(InstanceId::Poll(poll_id), option_index)
            .await?;
        if handle.is_zero() {
            return Err(OrchestratorError::validation(
                "this option has no encrypted votes yet",
            ));
        }
        let grantor = self.current_binding().signer;
        self.grants
            .submit_grant(self.ledger.as_ref(), grantor, handle, Principal::Public)
            .await
    }

    /// Runs a decrypt-and-reconcile pass for the selected instance.
    ///
    /// Pending grants are confirmed first; handles that become authorized
    /// are decrypted and their values frozen into the read model.
    ///
    /// # Errors
    ///
    /// `ValidationError` when no instance is selected; `Unauthorized` when
    /// no handle has a live grant; `ContextStale` or translated ledger
    /// errors from the pass itself.
    pub async fn decrypt(&self) -> Result<Option<Arc<ReadModelSnapshot>>, OrchestratorError> {
        // Epoch before selection: a reselection between the two reads can
        // only discard this pass, never let it publish under the new
        // selection.
        let epoch = self.reconciler.current_epoch();
        let instance = self
            .selected_instance()
            .ok_or_else(|| OrchestratorError::validation("no aggregation instance selected"))?;
        // Captured once here; a rebind while the pass is in flight stales
        // it at the decrypt request.
        let ctx = self.current_context();
        let _decrypting = self.begin_decrypting();
        let principals = self.session_principals().await;

        let any_live = {
            let handles = self.instance_handles(instance).await?;
            handles.iter().any(|(_, bytes)| {
                !bytes.is_zero()
                    && self.grants.effective_state(*bytes, &principals)
                        >= crate::model::AuthorizationState::AuthorizationPending
            })
        };
        if !any_live {
            return Err(OrchestratorError::unauthorized(
                "authorize decryption for at least one handle first",
            ));
        }

        self.reconciler
            .reconcile(&ctx, &self.session, instance, epoch, &principals)
            .await
    }

    /// Fetches the selected instance's handles and publishes a snapshot,
    /// decrypting whatever is already authorized.
    ///
    /// # Errors
    ///
    /// `ValidationError` when no instance is selected; pass errors
    /// otherwise.
    pub async fn load_encrypted_counts(
        &self,
    ) -> Result<Option<Arc<ReadModelSnapshot>>, OrchestratorError> {
        let epoch = self.reconciler.current_epoch();
        let instance = self
            .selected_instance()
            .ok_or_else(|| OrchestratorError::validation("no aggregation instance selected"))?;
        let ctx = self.current_context();
        let principals = self.session_principals().await;
        self.reconciler
            .reconcile(&ctx, &self.session, instance, epoch, &principals)
            .await
    }

    /// Refreshes contract data for the selected instance, if any.
    ///
    /// # Errors
    ///
    /// Pass errors when an instance is selected.
    pub async fn refresh_contract_data(
        &self,
    ) -> Result<Option<Arc<ReadModelSnapshot>>, OrchestratorError> {
        if self.selected_instance().is_none() {
            return Ok(None);
        }
        self.load_encrypted_counts().await
    }

    /// Spawns the background reconcile loop.
    ///
    /// One pass per configured interval for the selected instance; pass
    /// failures are logged and retried next cycle, never fatal. Cancel the
    /// returned token to stop the loop.
    #[must_use]
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> CancelToken {
        let token = CancelToken::new();
        let this = Arc::clone(self);
        let _handle = task::spawn_periodic(
            self.config.reconcile_interval,
            token.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    let epoch = this.reconciler.current_epoch();
                    let Some(instance) = this.selected_instance() else {
                        return;
                    };
                    let ctx = this.current_context();
                    let principals = this.session_principals().await;
                    if let Err(err) = this
                        .reconciler
                        .reconcile(&ctx, &this.session, instance, epoch, &principals)
                        .await
                    {
                        // Swallowed at pass level; next cycle retries.
                        warn!(%instance, error = %err, "reconciliation pass failed");
                    }
                }
            },
        );
        token
    }

    // -------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------

    /// Participant count (or total votes) from the latest snapshot.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.cache
            .snapshot()
            .map_or(0, |s| s.participant_count)
    }

    /// The encrypted-sum handle from the latest snapshot.
    #[must_use]
    pub fn sum_handle(&self) -> Option<HandleBytes> {
        self.cache
            .snapshot()
            .and_then(|s| s.sum_handle().map(|h| h.bytes))
    }

    /// The decrypted sum, once observed.
    #[must_use]
    pub fn decrypted_sum(&self) -> Option<u64> {
        self.cache.snapshot().and_then(|s| s.decrypted_sum())
    }

    /// The client-side average over the decrypted sum and the participant
    /// count.
    #[must_use]
    pub fn average(&self) -> Option<u64> {
        self.cache.snapshot().and_then(|s| s.average())
    }

    /// Poll metadata from the latest snapshot.
    #[must_use]
    pub fn poll_info(&self) -> Option<PollInfo> {
        self.cache.snapshot().and_then(|s| s.poll_info.clone())
    }

    /// Number of polls created so far.
    ///
    /// # Errors
    ///
    /// Translated ledger errors.
    pub async fn poll_count(&self) -> Result<u32, OrchestratorError> {
        self.ledger.poll_count().await.map_err(translate_ledger_error)
    }

    /// Raw handle bytes per slot from the latest snapshot.
    #[must_use]
    pub fn encrypted_counts(&self) -> BTreeMap<u32, HandleBytes> {
        self.cache
            .snapshot()
            .map(|s| s.encrypted_counts())
            .unwrap_or_default()
    }

    /// Decrypted values per slot from the latest snapshot.
    #[must_use]
    pub fn decrypted_counts(&self) -> BTreeMap<u32, u64> {
        self.cache
            .snapshot()
            .map(|s| s.decrypted_counts())
            .unwrap_or_default()
    }

    /// Whether a decrypt request is currently worth making.
    #[must_use]
    pub fn can_decrypt(&self) -> bool {
        self.cache.snapshot().is_some_and(|s| s.can_decrypt())
    }

    /// Whether a submission or grant is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.cache.is_processing()
    }

    /// Whether a decrypt pass is in flight.
    #[must_use]
    pub fn is_decrypting(&self) -> bool {
        self.cache.is_decrypting()
    }

    /// The current user-facing message, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.cache.message()
    }

    /// Whether the signer already voted in `poll_id`.
    ///
    /// # Errors
    ///
    /// Translated ledger errors.
    pub async fn has_voted(&self, poll_id: u32) -> Result<bool, OrchestratorError> {
        let subject = self.current_binding().signer;
        self.ledger
            .has_submitted(subject, InstanceId::Poll(poll_id))
            .await
            .map_err(translate_ledger_error)
    }

    /// Whether the signer is the HR admin.
    ///
    /// # Errors
    ///
    /// Translated ledger errors.
    pub async fn is_hr(&self) -> Result<bool, OrchestratorError> {
        let hr = self
            .ledger
            .hr_admin()
            .await
            .map_err(translate_ledger_error)?;
        Ok(hr == self.current_binding().signer)
    }

    /// Subscribes to snapshot publications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ReadModelSnapshot>>> {
        self.cache.subscribe()
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    async fn poll_info_for(&self, poll_id: u32) -> Result<PollInfo, OrchestratorError> {
        if let Some(snapshot) = self.cache.snapshot() {
            if snapshot.instance == InstanceId::Poll(poll_id) {
                if let Some(info) = &snapshot.poll_info {
                    return Ok(info.clone());
                }
            }
        }
        self.ledger
            .poll_info(poll_id)
            .await
            .map_err(translate_ledger_error)
    }

    async fn instance_handles(
        &self,
        instance: InstanceId,
    ) -> Result<Vec<(u32, HandleBytes)>, OrchestratorError> {
        if let Some(snapshot) = self.cache.snapshot() {
            if snapshot.instance == instance {
                return Ok(snapshot.handles.iter().map(|h| (h.slot, h.bytes)).collect());
            }
        }
        self.ledger
            .handles(instance)
            .await
            .map_err(translate_ledger_error)
    }

    async fn handle_for(
        &self,
        instance: InstanceId,
        slot: u32,
    ) -> Result<HandleBytes, OrchestratorError> {
        self.instance_handles(instance)
            .await?
            .into_iter()
            .find_map(|(s, bytes)| (s == slot).then_some(bytes))
            .ok_or_else(|| {
                OrchestratorError::validation(format!("{instance} has no ciphertext slot {slot}"))
            })
    }

    fn begin_processing(&self) -> FlagGuard<'_> {
        self.cache.set_processing(true);
        FlagGuard {
            cache: &self.cache,
            decrypting: false,
        }
    }

    fn begin_decrypting(&self) -> FlagGuard<'_> {
        self.cache.set_decrypting(true);
        FlagGuard {
            cache: &self.cache,
            decrypting: true,
        }
    }

    fn note_success(&self, text: impl Into<String>) {
        self.show_message(text.into(), self.config.success_message_ttl);
    }

    fn note_error(&self, text: impl Into<String>) {
        self.show_message(text.into(), self.config.error_message_ttl);
    }

    fn show_message(&self, text: String, ttl: Duration) {
        let seq = self.cache.set_message(text);
        let token = CancelToken::new();
        {
            let mut slot = self
                .dismiss_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        let cache = Arc::clone(&self.cache);
        let _handle = task::spawn_after(ttl, token, move || cache.clear_message_if(seq));
    }
}

/// Resets the processing/decrypting flag on drop, success or failure alike.
struct FlagGuard<'a> {
    cache: &'a ReadModelCache,
    decrypting: bool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        if self.decrypting {
            self.cache.set_decrypting(false);
        } else {
            self.cache.set_processing(false);
        }
    }
}
