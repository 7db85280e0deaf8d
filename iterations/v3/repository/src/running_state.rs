//! Live, observable wrapper around a `StreamState`.
//!
//! Modeled as a last-value-caching broadcast rather than a bare
//! `tokio::sync::watch` channel, because `watch` alone has neither a
//! subscriber count nor a terminal flag — both are layered on top
//! here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use agent_agency_repository_contracts::StreamState;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub struct RunningState {
    sender: watch::Sender<StreamState>,
    subscription_count: AtomicUsize,
    complete: AtomicBool,
    is_pinned: AtomicBool,
    capability_expiry: StdMutex<Option<DateTime<Utc>>>,
}

impl RunningState {
    pub fn new(initial: StreamState, is_pinned: bool) -> Self {
        let (sender, _receiver) = watch::channel(initial);
        Self {
            sender,
            subscription_count: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            is_pinned: AtomicBool::new(is_pinned),
            capability_expiry: StdMutex::new(None),
        }
    }

    /// Deadline carried by the CACAO capability that authorised the current
    /// tip, if any (spec invariant 9). `None` means no deferred expiration
    /// check applies.
    pub fn capability_expiry(&self) -> Option<DateTime<Utc>> {
        *self
            .capability_expiry
            .lock()
            .expect("capability_expiry lock poisoned")
    }

    pub fn set_capability_expiry(&self, expiry: Option<DateTime<Utc>>) {
        *self
            .capability_expiry
            .lock()
            .expect("capability_expiry lock poisoned") = expiry;
    }

    pub fn current(&self) -> StreamState {
        self.sender.borrow().clone()
    }

    /// Replaces the current state and notifies subscribers, unless already
    /// `complete()` (a no-op, per invariant) or the new state is identical
    /// to the current one (rejected).
    pub fn next(&self, new_state: StreamState) {
        if self.complete.load(Ordering::SeqCst) {
            return;
        }
        if *self.sender.borrow() == new_state {
            return;
        }
        // `send` only errors when every receiver (including the one this
        // sender would implicitly hold) has dropped, which cannot happen
        // here since `RunningState` owns the sender for its own lifetime.
        let _ = self.sender.send(new_state);
    }

    /// Registers a new observer and returns a subscription that decrements
    /// the count again on drop.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscription_count.fetch_add(1, Ordering::SeqCst);
        Subscription {
            state: self.clone(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Terminal; idempotent. After this, `next` is a no-op.
    pub fn complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::SeqCst)
    }

    pub fn is_pinned(&self) -> bool {
        self.is_pinned.load(Ordering::SeqCst)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.is_pinned.store(pinned, Ordering::SeqCst);
    }
}

/// A live observer of a `RunningState`. Dropping this decrements the
/// subscription count (the `free` half of `updates$`'s endure/free pairing
/// lives in `Repository`, keyed off this drop).
pub struct Subscription {
    state: Arc<RunningState>,
    receiver: watch::Receiver<StreamState>,
}

impl Subscription {
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.receiver.changed().await
    }

    pub fn current(&self) -> StreamState {
        self.receiver.borrow().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.subscription_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_agency_repository_contracts::{AnchorStatus, Cid, CommitType, LogEntry, StreamMetadata};

    fn state(tip: &str) -> StreamState {
        StreamState {
            stream_type: 1,
            log: vec![LogEntry {
                cid: Cid::new(tip),
                commit_type: CommitType::Genesis,
                timestamp: None,
            }],
            content: serde_json::json!({}),
            metadata: StreamMetadata::default(),
            anchor_status: AnchorStatus::NotRequested,
            tip: Cid::new(tip),
        }
    }

    #[test]
    fn complete_makes_next_a_no_op() {
        let running = RunningState::new(state("a"), false);
        running.complete();
        running.next(state("b"));
        assert_eq!(running.current().tip, Cid::new("a"));
    }

    #[test]
    fn next_rejects_identical_state() {
        let running = RunningState::new(state("a"), false);
        running.next(state("a"));
        assert_eq!(running.current().tip, Cid::new("a"));
    }

    #[tokio::test]
    async fn subscription_count_tracks_subscribe_and_drop() {
        let running = Arc::new(RunningState::new(state("a"), false));
        assert_eq!(running.subscription_count(), 0);
        let sub = running.subscribe();
        assert_eq!(running.subscription_count(), 1);
        drop(sub);
        assert_eq!(running.subscription_count(), 0);
    }

    #[test]
    fn capability_expiry_defaults_to_none_and_is_settable() {
        let running = RunningState::new(state("a"), false);
        assert_eq!(running.capability_expiry(), None);
        let deadline = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        running.set_capability_expiry(Some(deadline));
        assert_eq!(running.capability_expiry(), Some(deadline));
    }

    #[tokio::test]
    async fn subscriber_observes_updates() {
        let running = Arc::new(RunningState::new(state("a"), false));
        let mut sub = running.subscribe();
        running.next(state("b"));
        sub.changed().await.unwrap();
        assert_eq!(sub.current().tip, Cid::new("b"));
    }
}
