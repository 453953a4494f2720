//! gridnode-relay — slots backed by an upstream WebDriver service.
//!
//! A relay slot does not start browsers itself. It forwards the
//! new-session request to a service that does (an Appium server, a
//! standalone driver, a cloud grid) and then proxies every command to it.
//!
//! # Architecture
//!
//! ```text
//! RelaySessionFactory ──POST /session──▶ upstream service
//!   │                                        ▲
//!   └── RelaySession ──/session/{id}/...─────┘
//!
//! RelayHealthMonitor ──GET /status (backoff)──▶ upstream service
//!   └── shared health flag ──▶ RelaySessionFactory::is_available
//! ```

pub mod client;
pub mod error;
pub mod factory;
pub mod health;

pub use error::{RelayError, RelayResult};
pub use factory::{RelaySession, RelaySessionFactory};
pub use health::{HealthTracker, ProbeResult, RelayHealth, RelayHealthMonitor};
