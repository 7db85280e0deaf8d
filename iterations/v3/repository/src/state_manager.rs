//! Turns commits into state transitions, drives sync, and coordinates with
//! the anchor service.
//!
//! `StateManager` depends on `LoaderCallbacks` rather than on `Repository`
//! directly, breaking the Repository↔StateManager construction cycle (spec
//! §9): `Repository` implements `LoaderCallbacks` and hands a trait object
//! to `StateManager::new` during `Repository::set_deps`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tracing::warn;

use agent_agency_repository_contracts::{
    AnchorRequestStore, AnchorService, AnchorStatus, Cid, CommitData, CommitId, ConflictResolution,
    ContractError, Dispatcher, HandlerRegistry, RepositoryError, RepositoryResult, StreamId,
    StreamState,
};
use agent_agency_repository_observability::MetricsCollector;

use crate::running_state::RunningState;

/// Loads or materialises the live `RunningState` for a stream. Implemented
/// by `Repository`; must not itself take the executionQ slot (callers of
/// `StateManager::apply_commit` already hold it).
#[async_trait]
pub trait LoaderCallbacks: Send + Sync {
    async fn get_or_load(&self, stream_id: &StreamId) -> RepositoryResult<Arc<RunningState>>;
}

pub struct StateManagerDeps {
    pub handler_registry: Arc<dyn HandlerRegistry>,
    pub conflict_resolution: Arc<dyn ConflictResolution>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub anchor_service: Arc<dyn AnchorService>,
    pub anchor_request_store: Arc<dyn AnchorRequestStore>,
    /// Applied to the dispatcher calls `sync` makes over the network (spec
    /// §7's "Recoverable" class: network timeouts, individual commit fetch
    /// failures). Exhausting retries here is itself still recoverable —
    /// `sync_inner` logs and leaves the running state at last-known-good.
    pub retry_config: agent_agency_resilience::retry::RetryConfig,
}

struct Inner {
    deps: StateManagerDeps,
    callbacks: Arc<dyn LoaderCallbacks>,
    metrics: Arc<MetricsCollector>,
    pinned_synced: StdMutex<HashSet<StreamId>>,
}

/// Cheap to clone (an `Arc` around its state); cloned into spawned sync
/// tasks so `sync`'s timeout can abandon the awaiting side without
/// cancelling the underlying work.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<Inner>,
}

impl StateManager {
    pub fn new(
        deps: StateManagerDeps,
        callbacks: Arc<dyn LoaderCallbacks>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                callbacks,
                metrics,
                pinned_synced: StdMutex::new(HashSet::new()),
            }),
        }
    }

    /// Applies `commit` against the stream's current running state, using
    /// conflict resolution when the candidate does not linearly extend the
    /// log. Publish/anchor side effects are `Repository`'s
    /// concern (`apply_write_opts`), not this method's, so the same state
    /// transition logic serves both the direct-commit and create/load call
    /// sites without double-triggering them.
    pub async fn apply_commit(
        &self,
        stream_id: &StreamId,
        commit: CommitData,
    ) -> RepositoryResult<Arc<RunningState>> {
        let running = self.inner.callbacks.get_or_load(stream_id).await?;
        let current = running.current();

        let handler = self
            .inner
            .deps
            .handler_registry
            .handler_for(current.stream_type)
            .ok_or_else(|| {
                RepositoryError::Collaborator(ContractError::unavailable(
                    "HandlerRegistry",
                    format!("no handler registered for stream type {}", current.stream_type),
                ))
            })?;

        let candidate = handler.apply_commit(&commit, Some(&current))?;
        let resolved = if extends_log(&current, &candidate) {
            candidate
        } else {
            self.inner.deps.conflict_resolution.resolve(&current, &candidate)
        };

        running.next(resolved);

        Ok(running)
    }

    /// Fetches the network tip and applies missing commits, resolving
    /// against `hint_state` if provided (the local copy's tip in
    /// `SYNC_ALWAYS`). Bounded by `timeout`: on elapse, the
    /// awaiting side gives up but the spawned sync task keeps running to
    /// completion and its eventual result is dropped.
    pub async fn sync(
        &self,
        stream_id: StreamId,
        running: Arc<RunningState>,
        timeout: Duration,
        hint_state: Option<StreamState>,
    ) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.sync_inner(&stream_id, running, hint_state).await
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = %err, "sync failed, state left at last-known-good"),
            Ok(Err(join_err)) => warn!(error = %join_err, "sync task panicked"),
            Err(_elapsed) => {
                warn!("sync timed out; abandoning wait, background task continues unaborted")
            }
        }
    }

    async fn sync_inner(
        &self,
        stream_id: &StreamId,
        running: Arc<RunningState>,
        hint_state: Option<StreamState>,
    ) -> RepositoryResult<()> {
        let dispatcher = self.inner.deps.dispatcher.clone();
        let retry_config = self.inner.deps.retry_config.clone();
        let fetch_tip_result = agent_agency_resilience::retry::retry(
            move || {
                let dispatcher = dispatcher.clone();
                let stream_id = stream_id.clone();
                Box::pin(async move { dispatcher.fetch_tip(&stream_id).await })
            },
            retry_config,
        )
        .await;
        let Some(net_tip) = (match fetch_tip_result {
            Ok(tip) => tip,
            Err(err) => {
                warn!(error = %err, "sync: fetch_tip failed after retries, leaving state at last-known-good");
                return Ok(());
            }
        }) else {
            return Ok(());
        };

        let current = running.current();
        if current.tip != net_tip {
            let dispatcher = self.inner.deps.dispatcher.clone();
            let retry_config = self.inner.deps.retry_config.clone();
            let cid = net_tip.clone();
            let fetch_commit_result = agent_agency_resilience::retry::retry(
                move || {
                    let dispatcher = dispatcher.clone();
                    let cid = cid.clone();
                    Box::pin(async move { dispatcher.fetch_commit(&cid).await })
                },
                retry_config,
            )
            .await;
            let Some(bytes) = (match fetch_commit_result {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, %net_tip, "sync: fetch_commit failed after retries, leaving state at last-known-good");
                    return Ok(());
                }
            }) else {
                warn!(%net_tip, "dispatcher advertised a tip it could not fetch");
                return Ok(());
            };
            let handler = self
                .inner
                .deps
                .handler_registry
                .handler_for(current.stream_type)
                .ok_or_else(|| {
                    RepositoryError::Collaborator(ContractError::unavailable(
                        "HandlerRegistry",
                        format!("no handler registered for stream type {}", current.stream_type),
                    ))
                })?;
            let commit_data = CommitData {
                cid: net_tip.clone(),
                payload: bytes,
                envelope: None,
                disable_timecheck: false,
            };
            let candidate = handler.apply_commit(&commit_data, Some(&current))?;
            let resolved = if extends_log(&current, &candidate) {
                candidate
            } else {
                self.inner.deps.conflict_resolution.resolve(&current, &candidate)
            };
            running.next(resolved);
        }

        if let Some(hint) = hint_state {
            let after_net = running.current();
            if hint.tip != after_net.tip {
                let winner = self.inner.deps.conflict_resolution.resolve(&after_net, &hint);
                running.next(winner);
            }
        }

        Ok(())
    }

    /// Replays from genesis to `commit_id`, by re-fetching and re-applying
    /// every commit in `base`'s log up to and including it. Disables the
    /// capability-expiration check during replay (the caller is responsible
    /// for enforcing it on the final snapshot).
    pub async fn at_commit(&self, base: &StreamState, commit_id: &CommitId) -> RepositoryResult<StreamState> {
        let position = base
            .log
            .iter()
            .position(|entry| entry.cid == commit_id.cid)
            .ok_or_else(|| RepositoryError::CommitNotInLog {
                stream: stream_display(&commit_id.stream_id),
                commit: commit_id.cid.to_string(),
            })?;

        let handler = self
            .inner
            .deps
            .handler_registry
            .handler_for(base.stream_type)
            .ok_or_else(|| {
                RepositoryError::Collaborator(ContractError::unavailable(
                    "HandlerRegistry",
                    format!("no handler registered for stream type {}", base.stream_type),
                ))
            })?;

        let mut state: Option<StreamState> = None;
        for entry in &base.log[..=position] {
            let bytes = self
                .inner
                .deps
                .dispatcher
                .fetch_commit(&entry.cid)
                .await?
                .ok_or_else(|| RepositoryError::CommitNotInLog {
                    stream: stream_display(&commit_id.stream_id),
                    commit: entry.cid.to_string(),
                })?;
            let commit_data = CommitData {
                cid: entry.cid.clone(),
                payload: bytes,
                envelope: None,
                disable_timecheck: true,
            };
            state = Some(handler.apply_commit(&commit_data, state.as_ref())?);
        }

        state.ok_or_else(|| RepositoryError::CommitNotInLog {
            stream: stream_display(&commit_id.stream_id),
            commit: commit_id.cid.to_string(),
        })
    }

    /// Locates the latest anchor commit at or before `at_time` and replays
    /// up to it.
    pub async fn at_time(
        &self,
        base: &StreamState,
        stream_id: &StreamId,
        at_time: chrono::DateTime<Utc>,
    ) -> RepositoryResult<StreamState> {
        let position = base.log.iter().rposition(|entry| {
            matches!(entry.commit_type, agent_agency_repository_contracts::CommitType::Anchor)
                && entry.timestamp.map(|t| t <= at_time).unwrap_or(false)
        });

        let Some(position) = position else {
            return Err(RepositoryError::CommitNotInLog {
                stream: stream_display(stream_id),
                commit: format!("no anchor commit at or before {at_time}"),
            });
        };

        let commit_id = CommitId {
            stream_id: stream_id.clone(),
            cid: base.log[position].cid.clone(),
        };
        self.at_commit(base, &commit_id).await
    }

    /// Reattaches a previously persisted anchor request to a freshly loaded
    /// running state (the second half of genesis loading).
    pub async fn confirm_anchor_response(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
        cid: &Cid,
    ) -> RepositoryResult<()> {
        let current = running.current();
        let mut updates = self.inner.deps.anchor_service.confirm(&current, cid).await?;
        if let Some(update) = updates.next().await {
            let mut new_state = running.current();
            new_state.anchor_status = update.status;
            running.next(new_state);
            if matches!(update.status, AnchorStatus::Anchored | AnchorStatus::Failed) {
                self.inner.deps.anchor_request_store.delete(stream_id).await?;
            }
        }
        Ok(())
    }

    /// Requests an anchor for the running state's current tip and persists
    /// the outstanding request record (the `anchor=true` write path).
    pub async fn request_anchor_for(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
    ) -> RepositoryResult<()> {
        let state = running.current();
        let mut updates = self.inner.deps.anchor_service.request_anchor(&state).await?;
        if let Some(update) = updates.next().await {
            let mut new_state = running.current();
            new_state.anchor_status = update.status;
            running.next(new_state);

            let record = agent_agency_repository_contracts::AnchorRequestRecord {
                stream_id: stream_id.clone(),
                commit_cid: state.tip.clone(),
                created_at: Utc::now(),
            };
            self.inner.deps.anchor_request_store.save(stream_id, &record).await?;
        }
        Ok(())
    }

    pub async fn publish_tip(&self, stream_id: &StreamId, cid: &Cid) -> RepositoryResult<()> {
        self.inner.deps.dispatcher.publish_tip(stream_id, cid).await?;
        Ok(())
    }

    pub fn mark_pinned_and_synced(&self, stream_id: &StreamId) {
        self.inner
            .pinned_synced
            .lock()
            .expect("pinned_synced lock poisoned")
            .insert(stream_id.clone());
    }

    pub fn mark_unpinned(&self, stream_id: &StreamId) {
        self.inner
            .pinned_synced
            .lock()
            .expect("pinned_synced lock poisoned")
            .remove(stream_id);
    }

    pub fn was_pinned_stream_synced(&self, stream_id: &StreamId) -> bool {
        self.inner
            .pinned_synced
            .lock()
            .expect("pinned_synced lock poisoned")
            .contains(stream_id)
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }
}

fn extends_log(current: &StreamState, candidate: &StreamState) -> bool {
    candidate.log.len() > current.log.len() && candidate.log[..current.log.len()] == current.log[..]
}

pub(crate) fn stream_display(stream_id: &StreamId) -> agent_agency_repository_contracts::StreamIdDisplay {
    agent_agency_repository_contracts::StreamIdDisplay(stream_id.to_string())
}
