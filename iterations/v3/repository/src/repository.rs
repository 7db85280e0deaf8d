//! Top-level façade coordinating the cache, the two execution queues, and
//! the collaborators.
//!
//! Built in two phases to avoid a construction cycle with `StateManager`:
//! `Repository::new` wires the queues and cache with no collaborators bound,
//! then `set_deps` constructs the `StateManager` around a `CacheLoader` that
//! holds only the cache, not a handle back to this `Repository`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use agent_agency_caching::StateCache;
use agent_agency_repository_config::RepositoryConfig;
use agent_agency_repository_contracts::{
    AnchorRequestStore, AnchorService, AnchorStatus, CommitData, CommitId, ConflictResolution,
    ContractError, Dispatcher, HandlerRegistry, IndexRecord, IndexingApi, PinStore,
    RepositoryError, RepositoryResult, StreamId, StreamState,
};
use agent_agency_repository_observability::MetricsCollector;

use crate::execution_queue::ExecutionQueue;
use crate::running_state::{RunningState, Subscription};
use crate::state_manager::{stream_display, LoaderCallbacks, StateManager, StateManagerDeps};

/// Numeric codes mirror callers that still pass the legacy sync-option
/// integers rather than constructing this enum directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    NeverSync,
    PreferCache,
    SyncAlways,
    SyncOnError,
}

impl SyncMode {
    pub fn try_from_code(code: i32) -> RepositoryResult<Self> {
        match code {
            0 => Ok(Self::NeverSync),
            1 => Ok(Self::PreferCache),
            2 => Ok(Self::SyncAlways),
            3 => Ok(Self::SyncOnError),
            other => Err(RepositoryError::InvalidSyncOption(format!(
                "unknown sync mode code {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOpts {
    pub sync: SyncMode,
    pub skip_cacao_expiration_checks: bool,
    pub timeout: Option<Duration>,
}

impl Default for LoadOpts {
    fn default() -> Self {
        Self {
            sync: SyncMode::PreferCache,
            skip_cacao_expiration_checks: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOpts {
    pub pin: Option<bool>,
    pub publish: bool,
    pub anchor: bool,
}

#[derive(Debug, Clone)]
pub struct CreateOpts {
    pub sync: SyncMode,
    pub skip_cacao_expiration_checks: bool,
    pub timeout: Option<Duration>,
    pub pin: Option<bool>,
    pub publish: bool,
    pub anchor: bool,
}

impl Default for CreateOpts {
    fn default() -> Self {
        Self {
            sync: SyncMode::PreferCache,
            skip_cacao_expiration_checks: false,
            timeout: None,
            pin: None,
            publish: false,
            anchor: false,
        }
    }
}

/// Distinguishes a genuine create from a deterministic stream resolving to
/// an existing one: the oracle is `log.length == 1`, not the call
/// site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Create,
    Update,
    Load,
}

/// Collaborators bound to a `Repository` via `set_deps`. Out of scope for
/// this crate: concrete implementations live in `reference` (for
/// tests and standalone use) or in real backend crates.
pub struct RepositoryDeps {
    pub handler_registry: Arc<dyn HandlerRegistry>,
    pub conflict_resolution: Arc<dyn ConflictResolution>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub anchor_service: Arc<dyn AnchorService>,
    pub anchor_request_store: Arc<dyn AnchorRequestStore>,
    pub pin_store: Arc<dyn PinStore>,
    pub indexing_api: Arc<dyn IndexingApi>,
}

/// Implements `LoaderCallbacks` by looking the running state up in the
/// cache only — no network fetch, no handle back to `Repository`. Callers of
/// `StateManager::apply_commit` are required to have already loaded the
/// stream into cache via `loadingQ`, per the fixed lock order.
struct CacheLoader {
    cache: Arc<StateCache<StreamId, Arc<RunningState>>>,
}

#[async_trait]
impl LoaderCallbacks for CacheLoader {
    async fn get_or_load(&self, stream_id: &StreamId) -> RepositoryResult<Arc<RunningState>> {
        self.cache
            .get(stream_id)
            .ok_or_else(|| RepositoryError::StreamNotFound(stream_display(stream_id)))
    }
}

pub struct Repository {
    config: RepositoryConfig,
    loading_q: ExecutionQueue,
    execution_q: ExecutionQueue,
    cache: Arc<StateCache<StreamId, Arc<RunningState>>>,
    metrics: Arc<MetricsCollector>,
    deps: OnceLock<RepositoryDeps>,
    state_manager: OnceLock<StateManager>,
    closed: AtomicBool,
}

impl Repository {
    /// Builds queues and cache with no collaborators bound yet; call
    /// `set_deps` before any other method or they panic (programmer error,
    /// not a runtime condition callers need to handle).
    pub fn new(config: RepositoryConfig, metrics: Arc<MetricsCollector>) -> Self {
        let eviction_metrics = metrics.clone();
        let cache = Arc::new(
            StateCache::new(config.cache_limit, move |stream_id: &StreamId, running: &Arc<RunningState>| {
                if running.subscription_count() > 0 {
                    warn!(%stream_id, "evicting cache entry with active subscribers");
                }
                running.complete();
                let metrics = eviction_metrics.clone();
                tokio::spawn(async move {
                    metrics
                        .increment_counter(agent_agency_repository_observability::metrics::names::CACHE_EVICTION)
                        .await;
                });
            })
            .expect("RepositoryConfig::validate_config guarantees cache_limit >= 1"),
        );
        Self {
            loading_q: ExecutionQueue::new(config.concurrency_limit).with_metrics(metrics.clone()),
            execution_q: ExecutionQueue::new(config.concurrency_limit).with_metrics(metrics.clone()),
            config,
            cache,
            metrics,
            deps: OnceLock::new(),
            state_manager: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_deps(&self, deps: RepositoryDeps) {
        let state_manager_deps = StateManagerDeps {
            handler_registry: deps.handler_registry.clone(),
            conflict_resolution: deps.conflict_resolution.clone(),
            dispatcher: deps.dispatcher.clone(),
            anchor_service: deps.anchor_service.clone(),
            anchor_request_store: deps.anchor_request_store.clone(),
            retry_config: self.config.retry.clone(),
        };
        let loader = Arc::new(CacheLoader {
            cache: self.cache.clone(),
        });
        let state_manager = StateManager::new(state_manager_deps, loader, self.metrics.clone());
        self.state_manager
            .set(state_manager)
            .unwrap_or_else(|_| panic!("set_deps called more than once"));
        self.deps
            .set(deps)
            .unwrap_or_else(|_| panic!("set_deps called more than once"));
    }

    fn deps(&self) -> &RepositoryDeps {
        self.deps
            .get()
            .expect("Repository::set_deps must be called before use")
    }

    fn state_manager(&self) -> &StateManager {
        self.state_manager
            .get()
            .expect("Repository::set_deps must be called before use")
    }

    fn check_closed(&self) -> RepositoryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RepositoryError::QueueClosed)
        } else {
            Ok(())
        }
    }

    pub async fn load(
        &self,
        stream_id: &StreamId,
        opts: &LoadOpts,
    ) -> RepositoryResult<Arc<RunningState>> {
        self.check_closed()?;
        let timeout = opts.timeout.unwrap_or_else(|| self.config.default_sync_timeout());
        let key = stream_id.to_string();
        let stream_id = stream_id.clone();
        let opts = opts.clone();
        self.loading_q
            .run(&key, move || async move {
                self.load_inner(&stream_id, &opts, timeout).await
            })
            .await
    }

    async fn load_inner(
        &self,
        stream_id: &StreamId,
        opts: &LoadOpts,
        timeout: Duration,
    ) -> RepositoryResult<Arc<RunningState>> {
        match opts.sync {
            SyncMode::PreferCache | SyncMode::SyncOnError => {
                let (running, already_synced) = self.load_genesis(stream_id).await?;
                if !already_synced {
                    self.state_manager()
                        .sync(stream_id.clone(), running.clone(), timeout, None)
                        .await;
                }
                self.after_sync(stream_id, &running, opts).await?;
                Ok(running)
            }
            SyncMode::NeverSync => {
                let (running, _already_synced) = self.load_genesis(stream_id).await?;
                self.after_sync(stream_id, &running, opts).await?;
                Ok(running)
            }
            SyncMode::SyncAlways => {
                let (local_running, _already_synced) = self.load_genesis(stream_id).await?;
                let local_tip_state = local_running.current();

                let net_genesis = self.fetch_genesis_over_network(stream_id).await?;
                let running = Arc::new(RunningState::new(net_genesis, false));
                self.cache.set(stream_id.clone(), running.clone());

                self.state_manager()
                    .sync(stream_id.clone(), running.clone(), timeout, Some(local_tip_state))
                    .await;
                self.after_sync(stream_id, &running, opts).await?;
                Ok(running)
            }
        }
    }

    /// Only ever reached from within a `loadingQ[streamId]`-owned task
    /// (`load`'s queued closure).
    async fn load_genesis(&self, stream_id: &StreamId) -> RepositoryResult<(Arc<RunningState>, bool)> {
        if let Some(running) = self.cache.get(stream_id) {
            self.metrics
                .increment_counter(agent_agency_repository_observability::metrics::names::CACHE_HIT_MEMORY)
                .await;
            return Ok((running, true));
        }

        if let Some(state) = self
            .deps()
            .pin_store
            .state_store()
            .load(stream_id)
            .await
            .map_err(RepositoryError::from)?
        {
            self.metrics
                .increment_counter(agent_agency_repository_observability::metrics::names::CACHE_HIT_LOCAL)
                .await;
            let running = Arc::new(RunningState::new(state, true));
            self.cache.set(stream_id.clone(), running.clone());

            if let Some(record) = self.deps().anchor_request_store.load(stream_id).await? {
                self.state_manager()
                    .confirm_anchor_response(stream_id, &running, &record.commit_cid)
                    .await?;
            }

            let already_synced = self.state_manager().was_pinned_stream_synced(stream_id);
            return Ok((running, already_synced));
        }

        self.metrics
            .increment_counter(agent_agency_repository_observability::metrics::names::CACHE_MISS)
            .await;
        let state = self.fetch_genesis_over_network(stream_id).await?;
        let running = Arc::new(RunningState::new(state, false));
        self.cache.set(stream_id.clone(), running.clone());
        Ok((running, false))
    }

    async fn fetch_genesis_over_network(&self, stream_id: &StreamId) -> RepositoryResult<StreamState> {
        let handler = self
            .deps()
            .handler_registry
            .handler_for(stream_id.stream_type)
            .ok_or_else(|| {
                RepositoryError::Collaborator(ContractError::unavailable(
                    "HandlerRegistry",
                    format!("no handler registered for stream type {}", stream_id.stream_type),
                ))
            })?;
        let bytes = self
            .deps()
            .dispatcher
            .fetch_commit(&stream_id.genesis)
            .await?
            .ok_or_else(|| RepositoryError::StreamNotFound(stream_display(stream_id)))?;
        let commit_data = CommitData {
            cid: stream_id.genesis.clone(),
            payload: bytes,
            envelope: None,
            disable_timecheck: true,
        };
        Ok(handler.apply_commit(&commit_data, None)?)
    }

    async fn after_sync(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
        opts: &LoadOpts,
    ) -> RepositoryResult<()> {
        if !opts.skip_cacao_expiration_checks {
            self.check_capability_expiration(stream_id, running.capability_expiry(), &running.current())?;
        }
        if running.is_pinned() {
            self.state_manager().mark_pinned_and_synced(stream_id);
        }
        Ok(())
    }

    /// An `Anchored` status is a covering proof the capability was valid
    /// when used; everything else is checked against `expiry`.
    /// `expiry` is `None` whenever the state was never attached to a
    /// caller-supplied capability envelope (e.g. replayed snapshots in this
    /// reference core), in which case the check is a deliberate no-op.
    fn check_capability_expiration(
        &self,
        stream_id: &StreamId,
        expiry: Option<DateTime<Utc>>,
        state: &StreamState,
    ) -> RepositoryResult<()> {
        if matches!(state.anchor_status, AnchorStatus::Anchored) {
            return Ok(());
        }
        if let Some(expiry) = expiry {
            if expiry <= Utc::now() {
                return Err(RepositoryError::CapabilityExpired(stream_display(stream_id)));
            }
        }
        Ok(())
    }

    pub async fn load_at_commit(
        &self,
        commit_id: &CommitId,
        opts: &LoadOpts,
    ) -> RepositoryResult<StreamState> {
        let mut base_opts = opts.clone();
        base_opts.skip_cacao_expiration_checks = true;
        let running = self.load(&commit_id.stream_id, &base_opts).await?;
        let snapshot = self.state_manager().at_commit(&running.current(), commit_id).await?;
        if !opts.skip_cacao_expiration_checks {
            self.check_capability_expiration(&commit_id.stream_id, None, &snapshot)?;
        }
        Ok(snapshot)
    }

    pub async fn load_at_time(
        &self,
        stream_id: &StreamId,
        at_time: DateTime<Utc>,
        opts: &LoadOpts,
    ) -> RepositoryResult<StreamState> {
        let running = self.load(stream_id, opts).await?;
        self.state_manager().at_time(&running.current(), stream_id, at_time).await
    }

    pub async fn apply_commit(
        &self,
        stream_id: &StreamId,
        commit: CommitData,
        opts: &WriteOpts,
    ) -> RepositoryResult<Arc<RunningState>> {
        self.check_closed()?;
        let key = stream_id.to_string();

        // loadingQ before executionQ: guarantees
        // the stream is in cache before StateManager's cache-only lookup runs.
        let stream_id_for_load = stream_id.clone();
        self.loading_q
            .run(&key, move || async move {
                self.load_genesis(&stream_id_for_load).await.map(|_| ())
            })
            .await?;

        let envelope_expiry = commit.envelope.as_ref().and_then(|e| e.expires_at);
        let stream_id_for_apply = stream_id.clone();
        let running = self
            .execution_q
            .run(&key, move || async move {
                self.state_manager().apply_commit(&stream_id_for_apply, commit).await
            })
            .await?;

        if let Some(expiry) = envelope_expiry {
            running.set_capability_expiry(Some(expiry));
        }

        self.apply_write_opts(stream_id, &running, opts, OpType::Update).await?;
        Ok(running)
    }

    pub async fn apply_create_opts(
        &self,
        stream_id: &StreamId,
        opts: &CreateOpts,
    ) -> RepositoryResult<Arc<RunningState>> {
        self.check_closed()?;
        let load_opts = LoadOpts {
            sync: opts.sync,
            skip_cacao_expiration_checks: opts.skip_cacao_expiration_checks,
            timeout: opts.timeout,
        };
        let running = self.load(stream_id, &load_opts).await?;
        let op_type = if running.current().is_genesis_only() {
            OpType::Create
        } else {
            OpType::Load
        };
        let write_opts = WriteOpts {
            pin: opts.pin,
            publish: opts.publish,
            anchor: opts.anchor,
        };
        self.apply_write_opts(stream_id, &running, &write_opts, op_type).await?;
        Ok(running)
    }

    async fn apply_write_opts(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
        opts: &WriteOpts,
        op_type: OpType,
    ) -> RepositoryResult<()> {
        if opts.publish {
            self.state_manager()
                .publish_tip(stream_id, &running.current().tip)
                .await?;
        }
        if opts.anchor {
            self.state_manager().request_anchor_for(stream_id, running).await?;
        }
        self.handle_pin_opts(stream_id, running, opts.pin, op_type).await?;

        // "persist if pinned": a pin policy no-op (the common
        // already-pinned update case) must not leave the pin store holding
        // the pre-update state, or a later evict+load rehydrates stale data.
        if running.is_pinned() {
            self.deps()
                .pin_store
                .state_store()
                .save(&running.current())
                .await?;
        }
        Ok(())
    }

    /// Pin-policy truth table: ordinary CRUD must never flip pin
    /// state except at creation, but streams tagged for indexing are always
    /// pinned since indexing requires durable state.
    async fn handle_pin_opts(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
        pin: Option<bool>,
        op_type: OpType,
    ) -> RepositoryResult<()> {
        let state = running.current();
        match op_type {
            OpType::Create => match pin {
                Some(false) => {}
                _ => self.pin_stream(stream_id, running, &state).await?,
            },
            OpType::Update | OpType::Load => match pin {
                None => {
                    let should_index = self
                        .deps()
                        .indexing_api
                        .should_index_stream(state.metadata.model.as_deref());
                    if should_index {
                        self.pin_stream(stream_id, running, &state).await?;
                    }
                }
                Some(_) => {
                    warn!(%stream_id, "pin option ignored outside create; pin state only changes at creation");
                }
            },
        }
        Ok(())
    }

    async fn pin_stream(
        &self,
        stream_id: &StreamId,
        running: &Arc<RunningState>,
        state: &StreamState,
    ) -> RepositoryResult<()> {
        self.deps().pin_store.add(state, false).await?;
        running.set_pinned(true);
        self.state_manager().mark_pinned_and_synced(stream_id);

        if self
            .deps()
            .indexing_api
            .should_index_stream(state.metadata.model.as_deref())
        {
            let record = IndexRecord {
                stream_id: stream_id.clone(),
                model: state.metadata.model.clone().unwrap_or_default(),
                content: state.content.clone(),
            };
            self.deps().indexing_api.index_stream(&record).await?;
        }
        Ok(())
    }

    /// Subscribes to a stream's live updates, enduring the cache entry for
    /// the subscription's lifetime. Resolves the running state via
    /// `fromMemoryOrStore` (memory first, then the pin store's local state
    /// store) so a stream that is pinned but currently evicted rehydrates
    /// as its stored, pinned state rather than a fresh unpinned one;
    /// `init` only seeds a brand-new running state when neither tier has
    /// anything for this stream yet.
    pub async fn updates(&self, init: StreamState) -> EnduredSubscription {
        let stream_id = init
            .stream_id()
            .expect("updates$ requires init.log to contain at least the genesis entry");

        let running = self.from_memory_or_store(&stream_id, init).await;

        self.cache.endure(stream_id.clone(), running.clone());
        EnduredSubscription {
            cache: self.cache.clone(),
            stream_id,
            subscription: running.subscribe(),
        }
    }

    /// Memory tier, then the pin store's local state store, then `init`
    /// as a fresh unpinned seed. Does not itself go to the network: a
    /// cache/store miss here seeds from the caller-supplied state rather
    /// than raising `StreamNotFound`, since `updates$` is meant to work
    /// even for a stream this node has never loaded through `load`.
    async fn from_memory_or_store(&self, stream_id: &StreamId, init: StreamState) -> Arc<RunningState> {
        if let Some(running) = self.cache.get(stream_id) {
            return running;
        }

        if let Ok(Some(stored)) = self.deps().pin_store.state_store().load(stream_id).await {
            let running = Arc::new(RunningState::new(stored, true));
            self.cache.set(stream_id.clone(), running.clone());
            return running;
        }

        let running = Arc::new(RunningState::new(init, false));
        self.cache.set(stream_id.clone(), running.clone());
        running
    }

    pub async fn unpin(&self, stream_id: &StreamId, opts: &WriteOpts) -> RepositoryResult<()> {
        let running = self
            .cache
            .get(stream_id)
            .ok_or_else(|| RepositoryError::StreamNotFound(stream_display(stream_id)))?;
        let state = running.current();

        if self
            .deps()
            .indexing_api
            .should_index_stream(state.metadata.model.as_deref())
        {
            return Err(RepositoryError::CannotUnpinIndexed(stream_display(stream_id)));
        }

        if opts.publish {
            self.state_manager().publish_tip(stream_id, &state.tip).await?;
        }

        running.set_pinned(false);
        self.state_manager().mark_unpinned(stream_id);
        self.deps().pin_store.rm(&state).await?;
        Ok(())
    }

    /// Asks the pin store's backing state store for *at most one* stored
    /// id (`limit = 1`), not for every pinned id: `PinStoreContractViolation`
    /// is reserved for the store itself breaking that limit, not for a node
    /// that simply has more than one legitimately pinned stream. Resolving
    /// the identifier back into a `StreamState` would require a codec this
    /// crate deliberately does not define; callers that need the state can
    /// pair this with their own `StreamId` parsing.
    pub async fn random_pinned_stream_state(&self) -> RepositoryResult<Option<String>> {
        let ids = self
            .deps()
            .pin_store
            .state_store()
            .list_stored_stream_ids(None, 1)
            .await?;
        if ids.len() > 1 {
            return Err(RepositoryError::PinStoreContractViolation(format!(
                "expected at most one stored id for limit=1, got {}",
                ids.len()
            )));
        }
        Ok(ids.into_iter().next())
    }

    pub async fn list_pinned(&self, stream_id: Option<&StreamId>) -> RepositoryResult<Vec<String>> {
        Ok(self.deps().pin_store.ls(stream_id).await?)
    }

    /// Non-blocking snapshot; `None` if the stream is not currently cached
    /// (a cache miss here does not trigger a load, unlike `load`).
    pub fn stream_state(&self, stream_id: &StreamId) -> Option<StreamState> {
        self.cache.get(stream_id).map(|running| running.current())
    }

    /// Idempotent: drains both queues, completes and evicts every cache
    /// entry, then closes the pin store and indexing API.
    pub async fn close(&self) -> RepositoryResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.loading_q.close().await;
        self.execution_q.close().await;

        for (stream_id, running) in self.cache.iterate() {
            running.complete();
            self.cache.delete(&stream_id);
        }

        if let Some(deps) = self.deps.get() {
            deps.pin_store.close().await?;
            deps.indexing_api.close().await?;
        }
        Ok(())
    }
}

/// A live `updates$` subscription: wraps `RunningState`'s `Subscription` and
/// releases the cache's endure-refcount on drop (the `free` half of the
/// endure/free pairing).
pub struct EnduredSubscription {
    cache: Arc<StateCache<StreamId, Arc<RunningState>>>,
    stream_id: StreamId,
    subscription: Subscription,
}

impl EnduredSubscription {
    pub async fn changed(&mut self) -> Result<(), tokio::sync::watch::error::RecvError> {
        self.subscription.changed().await
    }

    pub fn current(&self) -> StreamState {
        self.subscription.current()
    }
}

impl Drop for EnduredSubscription {
    fn drop(&mut self) {
        self.cache.free(&self.stream_id);
    }
}
