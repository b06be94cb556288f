//! tfsproxy Client - Protocol engine
//!
//! This crate drives one front end request (raw file or named file action)
//! through the routing, root, name, meta and data servers of a cluster:
//! peer sessions, the two-tier block location cache, segment planning,
//! batched sub-operations and the per-request state machine.

pub mod action;
pub mod batch;
pub mod block_cache;
mod custom;
pub mod dedup;
pub mod engine;
pub mod operation;
pub mod peer;
pub mod planner;
mod raw;
pub mod routing;

#[cfg(test)]
mod testing;

// Re-exports
pub use action::{ActionOutcome, ActionRequest};
pub use block_cache::{BlockLocationCache, MemoryRemoteCache, RemoteBlockCache};
pub use dedup::{DedupStore, MemoryDedupStore};
pub use engine::Engine;
pub use operation::State;
pub use peer::{PeerRole, TcpTransport, Transport};
pub use routing::RoutingContext;
