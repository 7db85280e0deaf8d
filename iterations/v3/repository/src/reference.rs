//! In-memory reference implementations of every collaborator contract (spec
//! §1, "thin reference adapters"). None of these are production
//! implementations — real deployments swap them for a networked dispatcher,
//! a schema-aware handler, a database-backed pin store, and so on — but they
//! let this crate's own integration tests (and standalone use) exercise the
//! full core without any external system.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use agent_agency_repository_contracts::{
    AnchorRequestRecord, AnchorRequestStore, AnchorService, AnchorStatus, AnchorStatusUpdate, Cid,
    CommitData, ConflictResolution, ContractError, ContractResult, Dispatcher, Handler,
    HandlerRegistry, IndexRecord, IndexingApi, KvStore, LogEntry, PinStore, StateStore, StreamId,
    StreamMetadata, StreamState,
};

/// Materialises commits into a `StreamState` by appending a log entry and
/// replacing `content` with the commit's JSON payload (or keeping it if the
/// payload does not parse as JSON). A stand-in for a schema-aware handler,
/// which this crate deliberately does not define.
pub struct EchoHandler {
    stream_type: u64,
}

impl EchoHandler {
    pub fn new(stream_type: u64) -> Self {
        Self { stream_type }
    }
}

impl Handler for EchoHandler {
    fn stream_type(&self) -> u64 {
        self.stream_type
    }

    fn apply_commit(
        &self,
        commit: &CommitData,
        previous: Option<&StreamState>,
    ) -> ContractResult<StreamState> {
        let content = serde_json::from_slice(&commit.payload).unwrap_or(serde_json::Value::Null);
        let entry = LogEntry {
            cid: commit.cid.clone(),
            commit_type: agent_agency_repository_contracts::CommitType::Signed,
            timestamp: Some(Utc::now()),
        };

        match previous {
            None => Ok(StreamState {
                stream_type: self.stream_type,
                log: vec![LogEntry {
                    commit_type: agent_agency_repository_contracts::CommitType::Genesis,
                    ..entry
                }],
                content,
                metadata: StreamMetadata::default(),
                anchor_status: AnchorStatus::NotRequested,
                tip: commit.cid.clone(),
            }),
            Some(previous) => {
                let mut log = previous.log.clone();
                log.push(entry);
                Ok(StreamState {
                    stream_type: self.stream_type,
                    log,
                    content,
                    metadata: previous.metadata.clone(),
                    anchor_status: previous.anchor_status,
                    tip: commit.cid.clone(),
                })
            }
        }
    }
}

/// Dispatches to whichever `Handler` was registered for a stream type.
pub struct SimpleHandlerRegistry {
    handlers: HashMap<u64, Box<dyn Handler>>,
}

impl SimpleHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(handler.stream_type(), Box::new(handler));
        self
    }
}

impl Default for SimpleHandlerRegistry {
    fn default() -> Self {
        Self::new().register(EchoHandler::new(0))
    }
}

impl HandlerRegistry for SimpleHandlerRegistry {
    fn handler_for(&self, stream_type: u64) -> Option<&(dyn Handler)> {
        self.handlers.get(&stream_type).map(|h| h.as_ref())
    }
}

/// Picks the longer log as the winner; ties break on the tip's content hash,
/// the only tie-break the collaborator contract permits.
pub struct LongestLogWins;

impl ConflictResolution for LongestLogWins {
    fn resolve(&self, current: &StreamState, candidate: &StreamState) -> StreamState {
        match candidate.log.len().cmp(&current.log.len()) {
            std::cmp::Ordering::Greater => candidate.clone(),
            std::cmp::Ordering::Less => current.clone(),
            std::cmp::Ordering::Equal => {
                if candidate.tip > current.tip {
                    candidate.clone()
                } else {
                    current.clone()
                }
            }
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    commits: HashMap<Cid, Vec<u8>>,
    tips: HashMap<StreamId, Cid>,
}

/// An in-memory network stand-in. Unavailable data maps to `Ok(None)` per
/// the `Dispatcher` contract rather than an error; `seed_commit`
/// and `seed_tip` let tests populate "network" state directly.
#[derive(Clone, Default)]
pub struct FakeDispatcher {
    state: Arc<AsyncMutex<DispatcherState>>,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_commit(&self, cid: Cid, bytes: Vec<u8>) {
        self.state.lock().await.commits.insert(cid, bytes);
    }

    pub async fn seed_tip(&self, stream_id: StreamId, cid: Cid) {
        self.state.lock().await.tips.insert(stream_id, cid);
    }

    pub async fn published_tip(&self, stream_id: &StreamId) -> Option<Cid> {
        self.state.lock().await.tips.get(stream_id).cloned()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn fetch_commit(&self, commit_id: &Cid) -> ContractResult<Option<Vec<u8>>> {
        Ok(self.state.lock().await.commits.get(commit_id).cloned())
    }

    async fn fetch_tip(&self, stream_id: &StreamId) -> ContractResult<Option<Cid>> {
        Ok(self.state.lock().await.tips.get(stream_id).cloned())
    }

    async fn publish_tip(&self, stream_id: &StreamId, cid: &Cid) -> ContractResult<()> {
        self.state
            .lock()
            .await
            .tips
            .insert(stream_id.clone(), cid.clone());
        Ok(())
    }
}

/// Immediately resolves any anchor/confirm request to `Anchored`, one update
/// per call. Good enough to exercise `confirmAnchorResponse` and
/// `request_anchor_for` without a real timestamping ledger.
#[derive(Clone, Default)]
pub struct InstantAnchorService {
    chain: String,
}

impl InstantAnchorService {
    pub fn new(chain: impl Into<String>) -> Self {
        Self { chain: chain.into() }
    }
}

#[async_trait]
impl AnchorService for InstantAnchorService {
    async fn request_anchor(
        &self,
        _state: &StreamState,
    ) -> ContractResult<BoxStream<'static, AnchorStatusUpdate>> {
        let update = AnchorStatusUpdate {
            status: AnchorStatus::Anchored,
            anchored_at: Some(Utc::now()),
            chain_id: Some(self.chain.clone()),
        };
        Ok(stream::iter(vec![update]).boxed())
    }

    async fn confirm(
        &self,
        _state: &StreamState,
        _cid: &Cid,
    ) -> ContractResult<BoxStream<'static, AnchorStatusUpdate>> {
        let update = AnchorStatusUpdate {
            status: AnchorStatus::Anchored,
            anchored_at: Some(Utc::now()),
            chain_id: Some(self.chain.clone()),
        };
        Ok(stream::iter(vec![update]).boxed())
    }

    fn supported_chains(&self) -> Vec<String> {
        vec![self.chain.clone()]
    }
}

/// Byte-granular in-memory `KvStore`. Not used directly by the
/// other in-memory reference adapters below (they keep typed state instead
/// of serialising through this), but available for tests and for a real
/// `PinStore`/`AnchorRequestStore` implementation to build on.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    data: Arc<AsyncMutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &[u8]) -> ContractResult<Option<Vec<u8>>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> ContractResult<()> {
        self.data.lock().await.insert(key, value);
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> ContractResult<()> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn iterate(&self, prefix: &[u8]) -> ContractResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Backing store for `InMemoryPinStore`. A real deployment backs this with a
/// `KvStore`-keyed codec; this reference keeps typed `StreamState`s directly
/// since commit codecs are out of scope.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<AsyncMutex<HashMap<StreamId, StreamState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, id: &StreamId) -> ContractResult<Option<StreamState>> {
        Ok(self.states.lock().await.get(id).cloned())
    }

    async fn save(&self, state: &StreamState) -> ContractResult<()> {
        let id = state.stream_id().ok_or_else(|| {
            ContractError::protocol("StateStore", "cannot save a state with an empty log")
        })?;
        self.states.lock().await.insert(id, state.clone());
        Ok(())
    }

    async fn list_stored_stream_ids(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> ContractResult<Vec<String>> {
        let states = self.states.lock().await;
        let mut ids: Vec<String> = states.keys().map(|id| id.to_string()).collect();
        ids.sort();
        let start = match cursor {
            Some(cursor) => ids.iter().position(|id| id == &cursor).map(|p| p + 1).unwrap_or(0),
            None => 0,
        };
        Ok(ids.into_iter().skip(start).take(limit).collect())
    }
}

/// In-memory `PinStore`: pinning durably persists the state into the backing
/// `InMemoryStateStore`; unpinning removes it, so a later `_loadGenesis`
/// cannot resurrect state for a stream that is no longer pinned.
#[derive(Clone)]
pub struct InMemoryPinStore {
    store: Arc<InMemoryStateStore>,
    pinned: Arc<AsyncMutex<HashSet<StreamId>>>,
}

impl InMemoryPinStore {
    pub fn new(store: Arc<InMemoryStateStore>) -> Self {
        Self {
            store,
            pinned: Arc::new(AsyncMutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl PinStore for InMemoryPinStore {
    fn state_store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    async fn add(&self, state: &StreamState, _force: bool) -> ContractResult<()> {
        self.store.save(state).await?;
        let id = state.stream_id().ok_or_else(|| {
            ContractError::protocol("PinStore", "cannot pin a state with an empty log")
        })?;
        self.pinned.lock().await.insert(id);
        Ok(())
    }

    async fn rm(&self, state: &StreamState) -> ContractResult<()> {
        let id = state.stream_id().ok_or_else(|| {
            ContractError::protocol("PinStore", "cannot unpin a state with an empty log")
        })?;
        self.pinned.lock().await.remove(&id);
        self.store.states.lock().await.remove(&id);
        Ok(())
    }

    async fn ls(&self, stream_id: Option<&StreamId>) -> ContractResult<Vec<String>> {
        let pinned = self.pinned.lock().await;
        let ids = match stream_id {
            Some(id) => pinned.iter().filter(|p| *p == id).map(|id| id.to_string()).collect(),
            None => pinned.iter().map(|id| id.to_string()).collect(),
        };
        Ok(ids)
    }

    async fn close(&self) -> ContractResult<()> {
        Ok(())
    }
}

/// In-memory `AnchorRequestStore`.
#[derive(Clone, Default)]
pub struct InMemoryAnchorRequestStore {
    records: Arc<AsyncMutex<HashMap<StreamId, AnchorRequestRecord>>>,
}

impl InMemoryAnchorRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchorRequestStore for InMemoryAnchorRequestStore {
    async fn load(&self, id: &StreamId) -> ContractResult<Option<AnchorRequestRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn save(&self, id: &StreamId, record: &AnchorRequestRecord) -> ContractResult<()> {
        self.records.lock().await.insert(id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &StreamId) -> ContractResult<()> {
        self.records.lock().await.remove(id);
        Ok(())
    }
}

/// In-memory `IndexingApi`: a fixed set of model names that qualify for
/// indexing, and a log of every record handed to `index_stream` for test
/// assertions.
#[derive(Clone, Default)]
pub struct InMemoryIndexingApi {
    indexed_models: HashSet<String>,
    indexed: Arc<AsyncMutex<Vec<IndexRecord>>>,
}

impl InMemoryIndexingApi {
    pub fn new(indexed_models: impl IntoIterator<Item = String>) -> Self {
        Self {
            indexed_models: indexed_models.into_iter().collect(),
            indexed: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }

    pub async fn indexed_records(&self) -> Vec<IndexRecord> {
        self.indexed.lock().await.clone()
    }
}

#[async_trait]
impl IndexingApi for InMemoryIndexingApi {
    async fn init(&self) -> ContractResult<()> {
        Ok(())
    }

    async fn close(&self) -> ContractResult<()> {
        Ok(())
    }

    fn should_index_stream(&self, model: Option<&str>) -> bool {
        model.map(|m| self.indexed_models.contains(m)).unwrap_or(false)
    }

    async fn index_stream(&self, record: &IndexRecord) -> ContractResult<()> {
        self.indexed.lock().await.push(record.clone());
        Ok(())
    }
}
