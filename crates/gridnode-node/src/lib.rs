//! gridnode-node — the session-slot scheduler of a grid node.
//!
//! A node advertises a fixed pool of slots. Each slot wraps an opaque
//! [`SessionFactory`] plus the stereotype it can satisfy, and hosts at most
//! one session at a time. The [`Node`]:
//!
//! - Reserves a matching free slot under a short pool lock, then starts the
//!   session outside the lock
//! - Tracks live sessions in an idle-expiring registry and reclaims their
//!   slot and temporary directories on eviction
//! - Drains on request (or after N sessions) and reports completion once
//! - Publishes heartbeats carrying a fresh [`NodeStatus`]
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── Mutex<Vec<Arc<SessionSlot>>> (pool lock: scan + reserve only)
//!   │   └── SessionSlot (stereotype, factory, reserved flag, active session)
//!   ├── ExpiringCache<SessionId, SessionEntry> (idle timeout, swept)
//!   ├── TempFsRegistry<SessionId> (uploads)
//!   ├── TempFsRegistry<Uuid> (managed downloads)
//!   ├── EventBus (heartbeat, drain, session-closed)
//!   └── Background workers (session sweep, upload sweep, download sweep, heartbeat)
//! ```
//!
//! [`NodeStatus`]: gridnode_core::NodeStatus

pub mod cache;
pub mod downloads;
pub mod error;
pub mod external;
pub mod factory;
pub mod node;
pub mod slot;
pub mod tempfs;
pub mod workers;

pub use cache::ExpiringCache;
pub use error::{NewSessionError, NodeError, NodeResult};
pub use factory::{ActiveSession, BoxFuture, SessionFactory};
pub use node::{CreateSessionResponse, Node, NodeBuilder, NodeOptions};
pub use slot::SessionSlot;
pub use tempfs::{TempFsRegistry, TemporaryFilesystem};
