//! Shared harness for end-to-end scenario tests: wires the repository core
//! to the in-memory reference collaborators from `agent_agency_repository::reference`.

use std::sync::Arc;

use agent_agency_repository::reference::{
    EchoHandler, FakeDispatcher, InMemoryAnchorRequestStore, InMemoryIndexingApi, InMemoryPinStore,
    InMemoryStateStore, InstantAnchorService, LongestLogWins, SimpleHandlerRegistry,
};
use agent_agency_repository::{Repository, RepositoryDeps};
use agent_agency_repository_config::RepositoryConfig;
use agent_agency_repository_contracts::{
    Cid, CommitData, CommitType, ContractResult, Handler, LogEntry, StreamId, StreamMetadata,
    StreamState,
};
use agent_agency_repository_observability::MetricsCollector;

/// Like `EchoHandler`, but tags `metadata.model` from the commit payload's
/// `"model"` field (stream type 1). `EchoHandler` never sets a model, so
/// tests that exercise "indexed ⇒ pinned" need a handler that can.
pub struct ModelTaggingHandler;

impl Handler for ModelTaggingHandler {
    fn stream_type(&self) -> u64 {
        1
    }

    fn apply_commit(
        &self,
        commit: &CommitData,
        previous: Option<&StreamState>,
    ) -> ContractResult<StreamState> {
        let payload: serde_json::Value =
            serde_json::from_slice(&commit.payload).unwrap_or(serde_json::Value::Null);
        let model = payload.get("model").and_then(|v| v.as_str()).map(String::from);
        let entry = LogEntry {
            cid: commit.cid.clone(),
            commit_type: CommitType::Signed,
            timestamp: None,
        };
        match previous {
            None => Ok(StreamState {
                stream_type: 1,
                log: vec![LogEntry { commit_type: CommitType::Genesis, ..entry }],
                content: payload,
                metadata: StreamMetadata { controllers: vec![], model },
                anchor_status: agent_agency_repository_contracts::AnchorStatus::NotRequested,
                tip: commit.cid.clone(),
            }),
            Some(previous) => {
                let mut log = previous.log.clone();
                log.push(entry);
                Ok(StreamState {
                    stream_type: 1,
                    log,
                    content: payload,
                    metadata: StreamMetadata {
                        controllers: previous.metadata.controllers.clone(),
                        model: model.or_else(|| previous.metadata.model.clone()),
                    },
                    anchor_status: previous.anchor_status,
                    tip: commit.cid.clone(),
                })
            }
        }
    }
}

pub struct Harness {
    pub repo: Arc<Repository>,
    pub dispatcher: FakeDispatcher,
    pub state_store: Arc<InMemoryStateStore>,
    pub anchor_requests: InMemoryAnchorRequestStore,
    pub indexing: InMemoryIndexingApi,
    pub metrics: Arc<MetricsCollector>,
}

/// Builds a `Repository` bound to fresh in-memory collaborators.
/// `indexed_models` names the models `should_index_stream` treats as
/// qualifying for indexing (empty means nothing auto-indexes).
pub fn harness(cache_limit: usize, indexed_models: Vec<&str>) -> Harness {
    let mut config = RepositoryConfig::default();
    config.cache_limit = cache_limit;
    config.concurrency_limit = 8;
    config.default_sync_timeout_ms = 200;
    config.validate_config().expect("harness config must validate");

    let metrics = Arc::new(MetricsCollector::new());
    let repo = Arc::new(Repository::new(config, metrics.clone()));

    let dispatcher = FakeDispatcher::new();
    let state_store = Arc::new(InMemoryStateStore::new());
    let pin_store = Arc::new(InMemoryPinStore::new(state_store.clone()));
    let anchor_requests = InMemoryAnchorRequestStore::new();
    let indexing = InMemoryIndexingApi::new(indexed_models.into_iter().map(String::from));

    let handler_registry = SimpleHandlerRegistry::new()
        .register(EchoHandler::new(0))
        .register(ModelTaggingHandler);

    repo.set_deps(RepositoryDeps {
        handler_registry: Arc::new(handler_registry),
        conflict_resolution: Arc::new(LongestLogWins),
        dispatcher: Arc::new(dispatcher.clone()),
        anchor_service: Arc::new(InstantAnchorService::new("test-chain")),
        anchor_request_store: Arc::new(anchor_requests.clone()),
        pin_store,
        indexing_api: Arc::new(indexing.clone()),
    });

    Harness {
        repo,
        dispatcher,
        state_store,
        anchor_requests,
        indexing,
        metrics,
    }
}

/// A fresh genesis `StreamId` with a distinct `Cid`, registered with the
/// dispatcher as fetchable so `fetch_genesis_over_network` can resolve it.
pub async fn seed_genesis(h: &Harness, label: &str, content: serde_json::Value) -> StreamId {
    let genesis_cid = Cid::new(format!("genesis-{label}"));
    let payload = serde_json::to_vec(&content).unwrap();
    h.dispatcher.seed_commit(genesis_cid.clone(), payload).await;
    StreamId::new(genesis_cid, 0)
}

/// Builds a `StreamState` entirely offline (no dispatcher/handler round
/// trip), for tests that need to inject a specific local or network branch
/// directly into a store rather than replay it through a commit.
pub fn offline_state(stream_id: &StreamId, cids: &[&str], content: serde_json::Value) -> StreamState {
    StreamState {
        stream_type: stream_id.stream_type,
        log: cids
            .iter()
            .enumerate()
            .map(|(i, cid)| LogEntry {
                cid: Cid::new(*cid),
                commit_type: if i == 0 { CommitType::Genesis } else { CommitType::Signed },
                timestamp: None,
            })
            .collect(),
        content,
        metadata: Default::default(),
        anchor_status: agent_agency_repository_contracts::AnchorStatus::NotRequested,
        tip: Cid::new(*cids.last().unwrap()),
    }
}

/// A fresh genesis `StreamId` of stream type 1 (`ModelTaggingHandler`),
/// whose payload tags `metadata.model` with `model`.
pub async fn seed_model_genesis(h: &Harness, label: &str, model: &str) -> StreamId {
    let genesis_cid = Cid::new(format!("genesis-{label}"));
    let payload = serde_json::to_vec(&serde_json::json!({ "model": model })).unwrap();
    h.dispatcher.seed_commit(genesis_cid.clone(), payload).await;
    StreamId::new(genesis_cid, 1)
}

pub fn commit(cid: &str, content: serde_json::Value) -> CommitData {
    CommitData {
        cid: Cid::new(cid),
        payload: serde_json::to_vec(&content).unwrap(),
        envelope: None,
        disable_timecheck: false,
    }
}
