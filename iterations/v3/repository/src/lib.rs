//! Content-addressed, append-only stream repository core: per-stream
//! serialisation, a bounded endured-aware cache, sync, conflict resolution,
//! and pin/anchor/index policy.
//!
//! Collaborators (dispatcher, handlers, anchor service, stores, indexing
//! API) are consumed as trait objects from `agent-agency-repository-contracts`;
//! this crate owns only the coordination core around them. Reference
//! in-memory implementations of every collaborator trait live in
//! [`reference`], used by this crate's own integration tests and available
//! for standalone use.

pub mod execution_queue;
pub mod reference;
pub mod repository;
pub mod running_state;
pub mod state_manager;

pub use execution_queue::ExecutionQueue;
pub use repository::{
    CreateOpts, EnduredSubscription, LoadOpts, OpType, Repository, RepositoryDeps, SyncMode,
    WriteOpts,
};
pub use running_state::{RunningState, Subscription};
pub use state_manager::{LoaderCallbacks, StateManager, StateManagerDeps};
