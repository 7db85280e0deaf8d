//! Data model for streams, commits, and the projected state the repository
//! core caches, synchronises, and pins.
//!
//! Commit formats, codecs, and the anchoring wire protocol are explicitly
//! out of scope: `Cid` and `Commit` are opaque content-addressed handles,
//! not a concrete encoding.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque content hash. The core never inspects the bytes; it only compares,
/// hashes, and displays them (e.g. as the tie-break in conflict resolution).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub String);

impl Cid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, comparable-by-value stream identifier: the genesis commit's
/// content hash plus a type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub genesis: Cid,
    pub stream_type: u64,
}

impl StreamId {
    pub fn new(genesis: Cid, stream_type: u64) -> Self {
        Self {
            genesis,
            stream_type,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}-{}", self.stream_type, self.genesis)
    }
}

/// A StreamID plus a specific commit hash within that stream's log;
/// addresses a historical snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId {
    pub stream_id: StreamId,
    pub cid: Cid,
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.stream_id, self.cid)
    }
}

/// Commit type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitType {
    Genesis,
    Signed,
    Anchor,
}

/// An opaque content-addressed commit: bytes + hash + type tag. Order and
/// semantics of the payload are the `Handler`'s concern, not the core's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub cid: Cid,
    pub commit_type: CommitType,
    pub payload: Vec<u8>,
}

/// A capability (CACAO) envelope attached to a signed commit. The core only
/// needs the expiry to decide whether to enforce or defer the check (spec
/// §4.4); the capability's internal structure is out of scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoEnvelope {
    pub expires_at: Option<DateTime<Utc>>,
}

/// Input handed to a `Handler` when applying a commit.
#[derive(Debug, Clone)]
pub struct CommitData {
    pub cid: Cid,
    pub payload: Vec<u8>,
    pub envelope: Option<CacaoEnvelope>,
    /// Set by `fromNetwork` genesis loads and by the base load underlying
    /// `loadAtCommit`; the caller of those flows is responsible for running
    /// the capability check on the final state.
    pub disable_timecheck: bool,
}

/// One entry in a stream's commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub cid: Cid,
    pub commit_type: CommitType,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Anchor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorStatus {
    NotRequested,
    Pending,
    Processing,
    Anchored,
    Failed,
}

/// Identities authorised to author commits, plus optional indexing tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub controllers: Vec<String>,
    pub model: Option<String>,
}

/// The deterministic projection of a stream's commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_type: u64,
    pub log: Vec<LogEntry>,
    pub content: serde_json::Value,
    pub metadata: StreamMetadata,
    pub anchor_status: AnchorStatus,
    pub tip: Cid,
}

impl StreamState {
    pub fn stream_id(&self) -> Option<StreamId> {
        self.log
            .first()
            .map(|entry| StreamId::new(entry.cid.clone(), self.stream_type))
    }

    /// `log.length == 1` is the oracle distinguishing a genuine create from a
    /// deterministic stream resolving to an existing one.
    pub fn is_genesis_only(&self) -> bool {
        self.log.len() == 1
    }

    pub fn is_pinnable_by_model(&self) -> bool {
        self.metadata.model.is_some()
    }
}

/// An outstanding anchor request, persisted so it survives process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequestRecord {
    pub stream_id: StreamId,
    pub commit_cid: Cid,
    pub created_at: DateTime<Utc>,
}

/// A progress update emitted by the `AnchorService` while a request is in
/// flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorStatusUpdate {
    pub status: AnchorStatus,
    pub anchored_at: Option<DateTime<Utc>>,
    pub chain_id: Option<String>,
}

/// A record handed to the indexing API once a stream qualifies.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub stream_id: StreamId,
    pub model: String,
    pub content: serde_json::Value,
}
