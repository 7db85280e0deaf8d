//! Retry policy for transient collaborator errors: network timeouts,
//! individual commit fetch failures.

pub mod retry;

pub use retry::*;
