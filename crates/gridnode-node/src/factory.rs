//! The seam between the scheduler and whatever actually starts browsers.
//!
//! Driver startup is opaque to the node: a [`SessionFactory`] turns a
//! [`CreateSessionRequest`] into a running [`ActiveSession`], which the
//! node can forward commands to and stop.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use url::Url;

use gridnode_core::{Capabilities, Command, CommandResponse, CreateSessionRequest, Dialect, SessionId};

use crate::error::{NewSessionError, NodeResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A running browser session owned by one slot.
pub trait ActiveSession: Send + Sync {
    fn id(&self) -> &SessionId;

    /// Where the driver for this session listens.
    fn uri(&self) -> &Url;

    /// Capabilities negotiated with the driver.
    fn capabilities(&self) -> &Capabilities;

    /// Dialect the new-session response is encoded in.
    fn downstream_dialect(&self) -> Dialect;

    fn start_time(&self) -> DateTime<Utc>;

    /// Forward a WebDriver command to the driver.
    fn execute(&self, command: Command) -> BoxFuture<'_, NodeResult<CommandResponse>>;

    /// Best-effort forced termination. Must not fail.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Starts sessions for one slot. May block on network or process I/O.
pub trait SessionFactory: Send + Sync {
    fn apply(
        &self,
        request: CreateSessionRequest,
    ) -> BoxFuture<'_, Result<Box<dyn ActiveSession>, NewSessionError>>;

    /// Factory-specific veto on top of stereotype matching.
    fn test(&self, _capabilities: &Capabilities) -> bool {
        true
    }

    fn supports_cdp(&self) -> bool {
        false
    }

    fn supports_bidi(&self) -> bool {
        false
    }

    /// Whether the backing service is reachable. A `false` here marks the
    /// whole node DOWN.
    fn is_available(&self) -> bool {
        true
    }
}
