//! In-process chain double for integration tests.
//!
//! [`MockChain`] implements both collaborator seams over one shared state:
//! the ledger side accumulates plaintext sums and counts exactly like the
//! homomorphic contracts would, and the backend side encrypts values as
//! little-endian bytes and serves decryption only for granted handles.
//! Knobs inject delays, revert reasons, and deferred grant visibility so
//! tests can open the race windows they need deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use veiltally_core::encryption::BackendError;
use veiltally_core::ledger::LedgerError;
use veiltally_core::{
    Address, CiphertextWithProof, EncryptionBackend, HandleBytes, InstanceId, LedgerClient,
    Orchestrator, OrchestratorConfig, PollInfo, Principal, SessionBinding, TxReceipt,
};

pub const CHAIN_ID: u64 = 31337;
pub const CONTRACT: Address = Address::repeat(0xcc);
pub const HR: Address = Address::repeat(0xaa);
pub const ALICE: Address = Address::repeat(1);
pub const BOB: Address = Address::repeat(2);
pub const CAROL: Address = Address::repeat(3);

struct PeriodState {
    sum: u64,
    handle: HandleBytes,
    submitters: HashSet<Address>,
}

struct PollState {
    title: String,
    description: String,
    options: Vec<String>,
    active: bool,
    ends_at: DateTime<Utc>,
    counts: Vec<u64>,
    handles: Vec<HandleBytes>,
    voters: HashSet<Address>,
}

#[derive(Default)]
struct State {
    plaintexts: HashMap<HandleBytes, u64>,
    periods: HashMap<u64, PeriodState>,
    current_period: u64,
    polls: Vec<PollState>,
    grants: HashSet<(HandleBytes, Principal)>,
    deferred_grants: HashSet<(HandleBytes, Principal)>,
    defer_grants: bool,
    fail_next_submit: Option<String>,
    handle_counter: u64,
    tx_counter: u64,
    active_handle_reads: u32,
    max_concurrent_handle_reads: u32,
}

impl State {
    fn fresh_handle(&mut self) -> HandleBytes {
        self.handle_counter += 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&self.handle_counter.to_le_bytes());
        bytes[31] = 0x5a;
        HandleBytes(bytes)
    }

    fn receipt(&mut self) -> TxReceipt {
        self.tx_counter += 1;
        TxReceipt {
            tx_hash: format!("0x{:064x}", self.tx_counter),
            confirmed_at: Utc::now(),
        }
    }
}

pub struct MockChain {
    state: Mutex<State>,
    submit_delay: Duration,
    read_delay: Duration,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Self::with_delays(Duration::ZERO, Duration::ZERO)
    }

    pub fn with_delays(submit_delay: Duration, read_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            submit_delay,
            read_delay,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next write transaction revert with `reason`.
    pub fn fail_next_submit(&self, reason: &str) {
        self.lock().fail_next_submit = Some(reason.to_owned());
    }

    /// While set, confirmed grant transactions stay invisible to the read
    /// path until [`Self::publish_deferred_grants`] is called.
    pub fn set_defer_grants(&self, defer: bool) {
        self.lock().defer_grants = defer;
    }

    pub fn publish_deferred_grants(&self) {
        let mut state = self.lock();
        let deferred: Vec<_> = state.deferred_grants.drain().collect();
        state.grants.extend(deferred);
    }

    pub fn close_poll(&self, poll_id: u32) {
        if let Some(poll) = self.lock().polls.get_mut(poll_id as usize) {
            poll.active = false;
        }
    }

    /// Rewrites the plaintext behind a handle, simulating a backend that
    /// later reports a different value for the same ciphertext.
    pub fn corrupt_plaintext(&self, handle: HandleBytes, value: u64) {
        self.lock().plaintexts.insert(handle, value);
    }

    pub fn tx_count(&self) -> u64 {
        self.lock().tx_counter
    }

    pub fn max_concurrent_handle_reads(&self) -> u32 {
        self.lock().max_concurrent_handle_reads
    }

    fn decode(payload: &CiphertextWithProof) -> Result<u64, LedgerError> {
        payload
            .ciphertext
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| LedgerError::Reverted {
                reason: "malformed ciphertext".to_owned(),
            })
    }
}

#[async_trait]
impl LedgerClient for MockChain {
    async fn submit_ciphertext(
        &self,
        subject: Address,
        instance: InstanceId,
        slot: u32,
        payload: &CiphertextWithProof,
    ) -> Result<TxReceipt, LedgerError> {
        tokio::time::sleep(self.submit_delay).await;
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_submit.take() {
            return Err(LedgerError::Reverted { reason });
        }
        let value = Self::decode(payload)?;
        match instance {
            InstanceId::SalaryPeriod(period) => {
                let sum = {
                    let entry = state.periods.entry(period).or_insert_with(|| PeriodState {
                        sum: 0,
                        handle: HandleBytes::ZERO,
                        submitters: HashSet::new(),
                    });
                    if !entry.submitters.insert(subject) {
                        return Err(LedgerError::Reverted {
                            reason: "Already submitted this period".to_owned(),
                        });
                    }
                    entry.sum += value;
                    entry.sum
                };
                let fresh = state.fresh_handle();
                state.plaintexts.insert(fresh, sum);
                if let Some(entry) = state.periods.get_mut(&period) {
                    entry.handle = fresh;
                }
            }
            InstanceId::Poll(poll_id) => {
                let count = {
                    let poll = state.polls.get_mut(poll_id as usize).ok_or_else(|| {
                        LedgerError::Reverted {
                            reason: "unknown poll".to_owned(),
                        }
                    })?;
                    if !poll.active {
                        return Err(LedgerError::Reverted {
                            reason: "Poll not active".to_owned(),
                        });
                    }
                    let slot = slot as usize;
                    if slot >= poll.options.len() {
                        return Err(LedgerError::Reverted {
                            reason: "Invalid option".to_owned(),
                        });
                    }
                    if !poll.voters.insert(subject) {
                        return Err(LedgerError::Reverted {
                            reason: "Already voted".to_owned(),
                        });
                    }
                    poll.counts[slot] += 1;
                    poll.counts[slot]
                };
                let fresh = state.fresh_handle();
                state.plaintexts.insert(fresh, count);
                if let Some(poll) = state.polls.get_mut(poll_id as usize) {
                    poll.handles[slot as usize] = fresh;
                }
            }
        }
        Ok(state.receipt())
    }

    async fn submit_grant(
        &self,
        _grantor: Address,
        handle: HandleBytes,
        principal: Principal,
    ) -> Result<TxReceipt, LedgerError> {
        tokio::time::sleep(self.submit_delay).await;
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_submit.take() {
            return Err(LedgerError::Reverted { reason });
        }
        if state.defer_grants {
            state.deferred_grants.insert((handle, principal));
        } else {
            state.grants.insert((handle, principal));
        }
        Ok(state.receipt())
    }

    async fn create_poll(
        &self,
        _creator: Address,
        title: &str,
        description: &str,
        options: &[String],
        ends_at: DateTime<Utc>,
    ) -> Result<(u32, TxReceipt), LedgerError> {
        let mut state = self.lock();
        state.polls.push(PollState {
            title: title.to_owned(),
            description: description.to_owned(),
            options: options.to_vec(),
            active: true,
            ends_at,
            counts: vec![0; options.len()],
            handles: vec![HandleBytes::ZERO; options.len()],
            voters: HashSet::new(),
        });
        let poll_id = (state.polls.len() - 1) as u32;
        let receipt = state.receipt();
        Ok((poll_id, receipt))
    }

    async fn poll_count(&self) -> Result<u32, LedgerError> {
        Ok(self.lock().polls.len() as u32)
    }

    async fn poll_info(&self, poll_id: u32) -> Result<PollInfo, LedgerError> {
        let state = self.lock();
        let poll = state
            .polls
            .get(poll_id as usize)
            .ok_or_else(|| LedgerError::Reverted {
                reason: "unknown poll".to_owned(),
            })?;
        Ok(PollInfo {
            title: poll.title.clone(),
            description: poll.description.clone(),
            options: poll.options.clone(),
            active: poll.active,
            total_votes: poll.counts.iter().sum(),
            ends_at: Some(poll.ends_at),
        })
    }

    async fn current_salary_period(&self) -> Result<u64, LedgerError> {
        Ok(self.lock().current_period)
    }

    async fn handles(&self, instance: InstanceId) -> Result<Vec<(u32, HandleBytes)>, LedgerError> {
        {
            let mut state = self.lock();
            state.active_handle_reads += 1;
            state.max_concurrent_handle_reads = state
                .max_concurrent_handle_reads
                .max(state.active_handle_reads);
        }
        tokio::time::sleep(self.read_delay).await;
        let mut state = self.lock();
        state.active_handle_reads -= 1;
        match instance {
            InstanceId::SalaryPeriod(period) => {
                let handle = state
                    .periods
                    .get(&period)
                    .map_or(HandleBytes::ZERO, |p| p.handle);
                Ok(vec![(0, handle)])
            }
            InstanceId::Poll(poll_id) => {
                let poll = state
                    .polls
                    .get(poll_id as usize)
                    .ok_or_else(|| LedgerError::Reverted {
                        reason: "unknown poll".to_owned(),
                    })?;
                Ok(poll
                    .handles
                    .iter()
                    .enumerate()
                    .map(|(slot, h)| (slot as u32, *h))
                    .collect())
            }
        }
    }

    async fn submission_count(&self, instance: InstanceId) -> Result<u64, LedgerError> {
        let state = self.lock();
        Ok(match instance {
            InstanceId::SalaryPeriod(period) => state
                .periods
                .get(&period)
                .map_or(0, |p| p.submitters.len() as u64),
            InstanceId::Poll(poll_id) => state
                .polls
                .get(poll_id as usize)
                .map_or(0, |p| p.counts.iter().sum()),
        })
    }

    async fn has_submitted(
        &self,
        subject: Address,
        instance: InstanceId,
    ) -> Result<bool, LedgerError> {
        let state = self.lock();
        Ok(match instance {
            InstanceId::SalaryPeriod(period) => state
                .periods
                .get(&period)
                .is_some_and(|p| p.submitters.contains(&subject)),
            InstanceId::Poll(poll_id) => state
                .polls
                .get(poll_id as usize)
                .is_some_and(|p| p.voters.contains(&subject)),
        })
    }

    async fn grant_confirmed(
        &self,
        handle: HandleBytes,
        principal: Principal,
    ) -> Result<bool, LedgerError> {
        Ok(self.lock().grants.contains(&(handle, principal)))
    }

    async fn hr_admin(&self) -> Result<Address, LedgerError> {
        Ok(HR)
    }
}

#[async_trait]
impl EncryptionBackend for MockChain {
    fn supports_chain(&self, chain_id: u64) -> bool {
        chain_id == CHAIN_ID
    }

    async fn encrypt_u64(
        &self,
        _binding: &SessionBinding,
        target_contract: Address,
        target_field: &str,
        value: u64,
    ) -> Result<CiphertextWithProof, BackendError> {
        Ok(CiphertextWithProof {
            ciphertext: value.to_le_bytes().to_vec(),
            proof: vec![0x01],
            target_contract,
            target_field: target_field.to_owned(),
        })
    }

    async fn request_decrypt(
        &self,
        binding: &SessionBinding,
        handles: &[HandleBytes],
    ) -> Result<HashMap<HandleBytes, u64>, BackendError> {
        let state = self.lock();
        let mut values = HashMap::new();
        for handle in handles {
            let authorized = state.grants.contains(&(*handle, Principal::Public))
                || state
                    .grants
                    .contains(&(*handle, Principal::Account(binding.signer)))
                || (binding.signer == HR && state.grants.contains(&(*handle, Principal::Hr)));
            if !authorized {
                return Err(BackendError::Denied { handle: *handle });
            }
            let value = state
                .plaintexts
                .get(handle)
                .copied()
                .ok_or_else(|| BackendError::Transport("unknown handle".to_owned()))?;
            values.insert(*handle, value);
        }
        Ok(values)
    }
}

pub fn orchestrator(chain: &Arc<MockChain>, signer: Address) -> Arc<Orchestrator> {
    orchestrator_with(chain, signer, OrchestratorConfig::default())
}

pub fn orchestrator_with(
    chain: &Arc<MockChain>,
    signer: Address,
    config: OrchestratorConfig,
) -> Arc<Orchestrator> {
    // Clone on the concrete Arc first; the annotation then drives the
    // unsizing coercion to the trait object.
    let backend: Arc<dyn EncryptionBackend> = chain.clone();
    let ledger: Arc<dyn LedgerClient> = chain.clone();
    Arc::new(
        Orchestrator::new(config, backend, ledger, CONTRACT, CHAIN_ID, signer)
            .expect("mock chain supports the test chain id"),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
