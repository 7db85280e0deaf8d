//! Error types shared by the repository core and the collaborator contracts
//! it consumes (dispatcher, handlers, anchor service, stores, indexing).

use std::fmt;

/// Error surfaced by a collaborator implementation (Dispatcher, Handler,
/// AnchorService, PinStore, AnchorRequestStore, IndexingAPI, KVStore).
///
/// Collaborators are external to the core so this is deliberately
/// a thin, source-preserving wrapper rather than a large enum of every
/// possible backend failure: the core only needs to know whether to log and
/// continue (network/timeout class) or propagate.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: &'static str,
        message: String,
    },

    #[error("{collaborator} request failed: {source}")]
    Backend {
        collaborator: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{collaborator} returned an invalid response: {message}")]
    Protocol {
        collaborator: &'static str,
        message: String,
    },
}

impl ContractError {
    pub fn backend(
        collaborator: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            collaborator,
            source: Box::new(source),
        }
    }

    pub fn unavailable(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            collaborator,
            message: message.into(),
        }
    }

    pub fn protocol(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            collaborator,
            message: message.into(),
        }
    }
}

/// Error kinds raised by the public Repository/StateManager surface.
///
/// Every public method either returns its result or raises exactly one of
/// these; internal helpers propagate them unchanged. Recoverable failures
/// (sync timeouts, individual fetch failures) never appear here — those are
/// logged at the call site and never returned.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("stream not found: {0}")]
    StreamNotFound(StreamIdDisplay),

    #[error("invalid sync option: {0}")]
    InvalidSyncOption(String),

    #[error("cannot unpin indexed stream: {0}")]
    CannotUnpinIndexed(StreamIdDisplay),

    #[error("pin store contract violation: {0}")]
    PinStoreContractViolation(String),

    #[error("execution queue is closed")]
    QueueClosed,

    #[error("commit {commit} not found in log of stream {stream}")]
    CommitNotInLog {
        stream: StreamIdDisplay,
        commit: String,
    },

    #[error("capability expired for stream {0}")]
    CapabilityExpired(StreamIdDisplay),

    #[error(transparent)]
    Collaborator(#[from] ContractError),
}

/// `StreamId`'s `Display` representation, captured at error-construction time
/// so `RepositoryError` does not need a dependency back on the `model` module
/// beyond what `Display` already provides.
#[derive(Debug, Clone)]
pub struct StreamIdDisplay(pub String);

impl fmt::Display for StreamIdDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type ContractResult<T> = Result<T, ContractError>;
