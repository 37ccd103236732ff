//! Local read-model cache.
//!
//! Holds the latest [`ReadModelSnapshot`] per selected instance plus the
//! transient UI-facing flags. Snapshots are immutable value objects
//! published wholesale over a `watch` channel; nothing mutates a snapshot
//! in place, so the presentation side never observes a torn read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::model::{Address, AuthorizationState, CiphertextHandle, InstanceId, PollInfo};

/// The reconciled view of one aggregation instance.
///
/// Built once per reconciliation pass and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ReadModelSnapshot {
    /// The instance this snapshot describes.
    pub instance: InstanceId,
    /// Poll metadata, when the instance is a poll.
    pub poll_info: Option<PollInfo>,
    /// Ciphertext handles in slot order.
    pub handles: Vec<CiphertextHandle>,
    /// Number of successful submissions (participants or total votes).
    pub participant_count: u64,
    /// The HR admin account, when the instance is a salary period.
    pub hr_admin: Option<Address>,
    /// When the pass that built this snapshot ran.
    pub taken_at: DateTime<Utc>,
}

impl ReadModelSnapshot {
    /// The handle at `slot`, if present.
    #[must_use]
    pub fn handle_for_slot(&self, slot: u32) -> Option<&CiphertextHandle> {
        self.handles.iter().find(|h| h.slot == slot)
    }

    /// The encrypted-sum handle (slot 0) of a salary period.
    #[must_use]
    pub fn sum_handle(&self) -> Option<&CiphertextHandle> {
        self.handle_for_slot(0)
    }

    /// The decrypted sum, once observed.
    #[must_use]
    pub fn decrypted_sum(&self) -> Option<u64> {
        self.sum_handle().and_then(|h| h.decrypted)
    }

    /// The client-side average: `floor(decrypted_sum / participant_count)`.
    ///
    /// Derived on every call from its two inputs, never cached, and absent
    /// whenever the sum is absent or the participant count is zero. It is
    /// never requested from the encrypted backend.
    #[must_use]
    pub fn average(&self) -> Option<u64> {
        let sum = self.decrypted_sum()?;
        if self.participant_count == 0 {
            return None;
        }
        Some(sum / self.participant_count)
    }

    /// Raw handle bytes per slot.
    #[must_use]
    pub fn encrypted_counts(&self) -> BTreeMap<u32, crate::model::HandleBytes> {
        self.handles.iter().map(|h| (h.slot, h.bytes)).collect()
    }

    /// Decrypted values per slot, for the slots that have one.
    #[must_use]
    pub fn decrypted_counts(&self) -> BTreeMap<u32, u64> {
        self.handles
            .iter()
            .filter_map(|h| h.decrypted.map(|v| (h.slot, v)))
            .collect()
    }

    /// Whether a decrypt request is worth making: at least one handle has a
    /// grant submitted (pending confirmation) or already observable.
    #[must_use]
    pub fn can_decrypt(&self) -> bool {
        self.handles
            .iter()
            .any(|h| h.authorization >= AuthorizationState::AuthorizationPending)
    }
}

#[derive(Debug, Default)]
struct TransientFlags {
    is_processing: bool,
    is_decrypting: bool,
    message: Option<String>,
}

/// The cache the presentation layer observes.
///
/// The snapshot is the only shared mutable resource in the orchestrator and
/// it is replaced wholesale, never updated field-by-field from concurrent
/// writers. Transient flags live beside it and carry no tally data.
#[derive(Debug)]
pub struct ReadModelCache {
    snapshot_tx: watch::Sender<Option<Arc<ReadModelSnapshot>>>,
    // Held so the channel stays open with zero external subscribers.
    _snapshot_rx: watch::Receiver<Option<Arc<ReadModelSnapshot>>>,
    flags: Mutex<TransientFlags>,
    message_seq: AtomicU64,
}

impl Default for ReadModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModelCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        Self {
            snapshot_tx,
            _snapshot_rx: snapshot_rx,
            flags: Mutex::new(TransientFlags::default()),
            message_seq: AtomicU64::new(0),
        }
    }

    fn flags(&self) -> std::sync::MutexGuard<'_, TransientFlags> {
        self.flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Publishes a new snapshot, replacing the previous one wholesale.
    pub fn publish(&self, snapshot: Arc<ReadModelSnapshot>) {
        self.snapshot_tx.send_replace(Some(snapshot));
    }

    /// Drops the current snapshot. Called on instance reselection so one
    /// instance's tallies can never show under another instance's id.
    pub fn invalidate(&self) {
        self.snapshot_tx.send_replace(None);
    }

    /// The latest snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<ReadModelSnapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribes to snapshot publications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ReadModelSnapshot>>> {
        self.snapshot_tx.subscribe()
    }

    /// Sets the processing flag (a submission or grant is in flight).
    pub fn set_processing(&self, value: bool) {
        self.flags().is_processing = value;
    }

    /// Whether a submission or grant is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.flags().is_processing
    }

    /// Sets the decrypting flag.
    pub fn set_decrypting(&self, value: bool) {
        self.flags().is_decrypting = value;
    }

    /// Whether a decrypt pass is in flight.
    #[must_use]
    pub fn is_decrypting(&self) -> bool {
        self.flags().is_decrypting
    }

    /// Sets the user-facing message and returns a sequence number that a
    /// scheduled dismissal must present to clear it. A newer message
    /// invalidates older dismissals.
    pub fn set_message(&self, text: impl Into<String>) -> u64 {
        let seq = self.message_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.flags().message = Some(text.into());
        seq
    }

    /// Clears the message only if no newer message replaced it.
    pub fn clear_message_if(&self, seq: u64) {
        if self.message_seq.load(Ordering::SeqCst) == seq {
            self.flags().message = None;
        }
    }

    /// The current user-facing message, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.flags().message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HandleBytes;

    fn handle(slot: u32, decrypted: Option<u64>) -> CiphertextHandle {
        CiphertextHandle {
            instance: InstanceId::SalaryPeriod(0),
            slot,
            bytes: HandleBytes([slot as u8 + 1; 32]),
            authorization: AuthorizationState::Unauthorized,
            decrypted,
        }
    }

    fn snapshot(handles: Vec<CiphertextHandle>, count: u64) -> ReadModelSnapshot {
        ReadModelSnapshot {
            instance: InstanceId::SalaryPeriod(0),
            poll_info: None,
            handles,
            participant_count: count,
            hr_admin: None,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn average_is_floor_division() {
        let snap = snapshot(vec![handle(0, Some(17_000))], 3);
        assert_eq!(snap.average(), Some(5_666));
    }

    #[test]
    fn average_absent_without_sum_or_participants() {
        assert_eq!(snapshot(vec![handle(0, None)], 3).average(), None);
        assert_eq!(snapshot(vec![handle(0, Some(100))], 0).average(), None);
    }

    #[test]
    fn can_decrypt_requires_a_live_grant() {
        let mut h = handle(0, None);
        assert!(!snapshot(vec![h.clone()], 1).can_decrypt());
        h.authorization = AuthorizationState::AuthorizationPending;
        assert!(snapshot(vec![h], 1).can_decrypt());
    }

    #[test]
    fn invalidate_drops_the_snapshot() {
        let cache = ReadModelCache::new();
        cache.publish(Arc::new(snapshot(vec![], 0)));
        assert!(cache.snapshot().is_some());
        cache.invalidate();
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn subscribers_observe_replacement() {
        let cache = ReadModelCache::new();
        let mut rx = cache.subscribe();
        cache.publish(Arc::new(snapshot(vec![handle(0, Some(1))], 1)));
        assert!(rx.has_changed().expect("channel open"));
        let seen = rx.borrow_and_update().clone().expect("published");
        assert_eq!(seen.participant_count, 1);
    }

    #[test]
    fn stale_dismissal_does_not_clear_newer_message() {
        let cache = ReadModelCache::new();
        let first = cache.set_message("submitted");
        let _second = cache.set_message("rejected");
        cache.clear_message_if(first);
        assert_eq!(cache.message().as_deref(), Some("rejected"));
    }

    #[test]
    fn current_dismissal_clears_message() {
        let cache = ReadModelCache::new();
        let seq = cache.set_message("submitted");
        cache.clear_message_if(seq);
        assert!(cache.message().is_none());
    }
}
