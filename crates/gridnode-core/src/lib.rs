//! gridnode-core — shared types for a session node.
//!
//! Everything the node scheduler exchanges with the rest of the grid lives
//! here: identifiers, capability sets, the session/slot/status snapshots,
//! the new-session request and response envelopes, the capability matcher,
//! and the event bus the node announces itself on.
//!
//! # Architecture
//!
//! ```text
//! gridnode-core
//!   ├── Capabilities + Platform (capability maps and platform families)
//!   ├── matcher (stereotype ↔ requested capability matching)
//!   ├── types (NodeId, SlotId, Session, Slot, NodeStatus, requests/responses)
//!   ├── events (NodeEvent, EventBus, LocalEventBus)
//!   └── config (NodeConfig loaded from TOML)
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod types;

pub use capabilities::{Capabilities, Platform};
pub use config::{NodeConfig, RelayConfig, SlotConfig};
pub use error::{CoreError, CoreResult};
pub use events::{CloseReason, EventBus, LocalEventBus, NodeEvent};
pub use matcher::{matches, DefaultSlotMatcher, SlotMatcher};
pub use types::*;
