//! Collaborator contracts consumed by the repository core.
//!
//! These are the interfaces of components explicitly out of scope for this
//! crate: commit handlers, the anchor service, conflict resolution, the
//! network dispatcher, the pin/anchor-request/key-value stores, and the
//! indexing API. The core depends only on these traits; concrete
//! implementations (real or reference/in-memory) live elsewhere.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ContractResult;
use crate::model::{
    AnchorRequestRecord, AnchorStatusUpdate, Cid, CommitData, IndexRecord, StreamId, StreamState,
};

/// Fetches commits and publishes tips over the network. Unavailable network
/// maps to `Ok(None)`, not an error — only genuine transport
/// failures are `Err`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn fetch_commit(&self, commit_id: &Cid) -> ContractResult<Option<Vec<u8>>>;
    async fn fetch_tip(&self, stream_id: &StreamId) -> ContractResult<Option<Cid>>;
    async fn publish_tip(&self, stream_id: &StreamId, cid: &Cid) -> ContractResult<()>;
}

/// Per-stream-type commit application. Pure function of its inputs; the
/// contract promises no I/O beyond calling context-provided helpers (spec
/// §6.1), so this trait is deliberately synchronous.
pub trait Handler: Send + Sync {
    fn stream_type(&self) -> u64;

    fn apply_commit(
        &self,
        commit: &CommitData,
        previous: Option<&StreamState>,
    ) -> ContractResult<StreamState>;
}

/// Selects the `Handler` registered for a commit's stream type.
pub trait HandlerRegistry: Send + Sync {
    fn handler_for(&self, stream_type: u64) -> Option<&(dyn Handler)>;
}

/// Deterministic winner selection between two states whose logs diverge
/// after a shared prefix. Must be total over equal-length logs
/// by hash comparison.
pub trait ConflictResolution: Send + Sync {
    fn resolve(&self, current: &StreamState, candidate: &StreamState) -> StreamState;
}

/// Signs commits into an external timestamping ledger.
#[async_trait]
pub trait AnchorService: Send + Sync {
    async fn request_anchor(
        &self,
        state: &StreamState,
    ) -> ContractResult<BoxStream<'static, AnchorStatusUpdate>>;

    async fn confirm(
        &self,
        state: &StreamState,
        cid: &Cid,
    ) -> ContractResult<BoxStream<'static, AnchorStatusUpdate>>;

    fn supported_chains(&self) -> Vec<String>;
}

/// Durable per-stream state storage, the backing store behind `PinStore`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, id: &StreamId) -> ContractResult<Option<StreamState>>;
    async fn save(&self, state: &StreamState) -> ContractResult<()>;
    async fn list_stored_stream_ids(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> ContractResult<Vec<String>>;
}

/// Tracks which streams are pinned (durably persisted locally). `state_store`
/// exposes the backing store used for the actual bytes.
#[async_trait]
pub trait PinStore: Send + Sync {
    fn state_store(&self) -> &dyn StateStore;

    async fn add(&self, state: &StreamState, force: bool) -> ContractResult<()>;
    async fn rm(&self, state: &StreamState) -> ContractResult<()>;
    async fn ls(&self, stream_id: Option<&StreamId>) -> ContractResult<Vec<String>>;
    async fn close(&self) -> ContractResult<()>;
}

/// Persists outstanding anchor requests so they survive restarts.
#[async_trait]
pub trait AnchorRequestStore: Send + Sync {
    async fn load(&self, id: &StreamId) -> ContractResult<Option<AnchorRequestRecord>>;
    async fn save(&self, id: &StreamId, record: &AnchorRequestRecord) -> ContractResult<()>;
    async fn delete(&self, id: &StreamId) -> ContractResult<()>;
}

/// Decides which streams to index and forwards qualifying ones.
#[async_trait]
pub trait IndexingApi: Send + Sync {
    async fn init(&self) -> ContractResult<()>;
    async fn close(&self) -> ContractResult<()>;
    fn should_index_stream(&self, model: Option<&str>) -> bool;
    async fn index_stream(&self, record: &IndexRecord) -> ContractResult<()>;
}

/// Byte-granular key-value storage backing the pin/anchor-request stores.
/// Durability/atomicity requirements are per the collaborator
/// that needs them, not the core.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> ContractResult<Option<Vec<u8>>>;
    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> ContractResult<()>;
    async fn del(&self, key: &[u8]) -> ContractResult<()>;
    async fn iterate(&self, prefix: &[u8]) -> ContractResult<Vec<(Vec<u8>, Vec<u8>)>>;
}
