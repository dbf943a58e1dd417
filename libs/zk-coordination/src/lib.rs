//! # zk-coordination
//!
//! Coordination layer for a fleet of cooperating server instances, built on
//! a session-oriented coordination service (ZooKeeper-style hierarchical
//! nodes, ephemeral membership, session state notifications).
//!
//! This library provides:
//! - **Session tracking** that only reports "connected" once the namespace,
//!   cache roots and party memberships of a fresh session are in place.
//! - **Retry executor** that retries on connection loss and nothing else.
//! - **Distributed lock** whose held flag is dropped the moment the session
//!   becomes unusable, regardless of what the client's lock recipe believes.
//! - **Party** membership with automatic re-join after session loss.
//! - **Shared cache** with incremental, timestamp-ordered sync into a local
//!   handler and expiry of stale entries.
//! - **In-memory coordination service** for tests and local runs.
//!
//! ## Design Principles
//!
//! - Client callbacks never block: they only signal a single session worker.
//! - Everything that depends on session validity is registered explicitly
//!   and re-initialized by that worker.
//! - The client sits behind the [`ZkClient`] trait so none of its types leak
//!   into callers.

pub mod cache;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod namespace;
pub mod party;
pub mod retry;
pub mod session;
pub mod signal;

// Re-export key types for convenient access
pub use cache::{CacheHandler, EntryMetadata, SharedCache};
pub use client::{NodeStat, SessionState, ZkClient};
pub use coordinator::{Coordinator, CoordinatorBuilder, WorkerHandle};
pub use error::{CoordinationError, CoordinationResult};
pub use lock::DistributedLock;
pub use memory::{MemoryClient, MemoryEnsemble};
pub use namespace::Namespace;
pub use party::Party;
pub use retry::RetryPolicy;
pub use session::Session;
