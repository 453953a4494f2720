//! SessionSlot — one unit of node capacity.
//!
//! A slot pairs a stereotype with the factory that can satisfy it, and hosts
//! at most one session. Its `reserved` flag is the only state that decides
//! whether the slot can be handed out; the node flips it while holding the
//! pool lock, so scan-and-reserve is atomic with respect to other callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use gridnode_core::{Capabilities, CreateSessionRequest, Session, Slot, SlotId, SlotMatcher};

use crate::error::NewSessionError;
use crate::factory::{ActiveSession, SessionFactory};

#[derive(Default)]
struct SlotState {
    /// The running session, as the driver reported it.
    active: Option<Arc<dyn ActiveSession>>,
    /// The same session as the grid sees it (rewritten endpoints).
    session: Option<Session>,
    last_started: Option<DateTime<Utc>>,
}

pub struct SessionSlot {
    id: SlotId,
    stereotype: Capabilities,
    factory: Arc<dyn SessionFactory>,
    matcher: Arc<dyn SlotMatcher>,
    reserved: AtomicBool,
    state: RwLock<SlotState>,
    created: DateTime<Utc>,
}

impl SessionSlot {
    pub fn new(
        id: SlotId,
        stereotype: Capabilities,
        factory: Arc<dyn SessionFactory>,
        matcher: Arc<dyn SlotMatcher>,
    ) -> Self {
        Self {
            id,
            stereotype,
            factory,
            matcher,
            reserved: AtomicBool::new(false),
            state: RwLock::new(SlotState::default()),
            created: Utc::now(),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn stereotype(&self) -> &Capabilities {
        &self.stereotype
    }

    /// Whether this slot could serve `capabilities`, ignoring occupancy.
    pub fn test(&self, capabilities: &Capabilities) -> bool {
        self.matcher.matches(&self.stereotype, capabilities) && self.factory.test(capabilities)
    }

    pub fn is_available(&self) -> bool {
        !self.reserved.load(Ordering::SeqCst)
    }

    /// Mark the slot taken. The caller must hold the node's pool lock.
    ///
    /// Returns `false` if the slot was already reserved.
    pub fn reserve(&self) -> bool {
        !self.reserved.swap(true, Ordering::SeqCst)
    }

    /// Forget the current session and make the slot available again.
    ///
    /// The caller must hold the node's pool lock.
    pub async fn release(&self) {
        self.clear().await;
        self.reserved.store(false, Ordering::SeqCst);
    }

    /// Start a session through the factory.
    ///
    /// May block for a long time. Never call this with the pool lock held.
    pub async fn apply(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Arc<dyn ActiveSession>, NewSessionError> {
        if self.state.read().await.active.is_some() {
            return Err(NewSessionError::retry("slot is busy, try another slot"));
        }
        if !self.test(&request.desired_capabilities) {
            return Err(NewSessionError::not_created(
                "requested capabilities do not match the slot stereotype",
            ));
        }

        let active: Arc<dyn ActiveSession> = Arc::from(self.factory.apply(request).await?);

        let mut state = self.state.write().await;
        state.active = Some(Arc::clone(&active));
        state.last_started = Some(active.start_time());
        debug!(slot = %self.id, session_id = %active.id(), "slot session started");
        Ok(active)
    }

    /// Publish the grid-facing view of the running session.
    pub async fn attach_session(&self, session: Session) {
        self.state.write().await.session = Some(session);
    }

    /// Terminate the running session, if any. Best effort.
    pub async fn stop(&self) {
        let active = self.state.write().await.active.take();
        if let Some(active) = active {
            debug!(slot = %self.id, session_id = %active.id(), "stopping slot session");
            active.stop().await;
        }
        self.clear().await;
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.read().await.session.clone()
    }

    pub async fn active(&self) -> Option<Arc<dyn ActiveSession>> {
        self.state.read().await.active.clone()
    }

    pub fn supports_cdp(&self) -> bool {
        self.factory.supports_cdp()
    }

    pub fn supports_bidi(&self) -> bool {
        self.factory.supports_bidi()
    }

    /// Whether the backing factory reports itself reachable.
    pub fn is_factory_available(&self) -> bool {
        self.factory.is_available()
    }

    /// Read-only projection for status reporting.
    pub async fn snapshot(&self) -> Slot {
        let state = self.state.read().await;
        Slot {
            id: self.id,
            stereotype: self.stereotype.clone(),
            session: state.session.clone(),
            last_started: state.last_started.unwrap_or(self.created),
        }
    }

    async fn clear(&self) {
        let mut state = self.state.write().await;
        state.active = None;
        state.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use gridnode_core::{Command, CommandResponse, DefaultSlotMatcher, Dialect, NodeId, SessionId};
    use url::Url;

    use crate::error::NodeResult;
    use crate::factory::BoxFuture;

    struct StubSession {
        id: SessionId,
        uri: Url,
        caps: Capabilities,
        stops: Arc<AtomicUsize>,
    }

    impl ActiveSession for StubSession {
        fn id(&self) -> &SessionId {
            &self.id
        }
        fn uri(&self) -> &Url {
            &self.uri
        }
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }
        fn downstream_dialect(&self) -> Dialect {
            Dialect::W3c
        }
        fn start_time(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn execute(&self, _command: Command) -> BoxFuture<'_, NodeResult<CommandResponse>> {
            Box::pin(async { Ok(CommandResponse::ok(Vec::new())) })
        }
        fn stop(&self) -> BoxFuture<'_, ()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct StubFactory {
        fail: bool,
        stops: Arc<AtomicUsize>,
    }

    impl SessionFactory for StubFactory {
        fn apply(
            &self,
            request: CreateSessionRequest,
        ) -> BoxFuture<'_, Result<Box<dyn ActiveSession>, NewSessionError>> {
            let fail = self.fail;
            let stops = Arc::clone(&self.stops);
            Box::pin(async move {
                if fail {
                    return Err(NewSessionError::not_created("boom"));
                }
                Ok(Box::new(StubSession {
                    id: SessionId::new("s1"),
                    uri: Url::parse("http://localhost:4444").unwrap(),
                    caps: request.desired_capabilities,
                    stops,
                }) as Box<dyn ActiveSession>)
            })
        }
    }

    fn slot(fail: bool) -> (SessionSlot, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(StubFactory {
            fail,
            stops: Arc::clone(&stops),
        });
        let slot = SessionSlot::new(
            SlotId::new(NodeId::new()),
            Capabilities::new().with("browserName", "chrome"),
            factory,
            Arc::new(DefaultSlotMatcher),
        );
        (slot, stops)
    }

    fn chrome() -> CreateSessionRequest {
        CreateSessionRequest::new(Capabilities::new().with("browserName", "chrome"))
    }

    #[test]
    fn reserve_is_exclusive() {
        let (slot, _) = slot(false);
        assert!(slot.is_available());
        assert!(slot.reserve());
        assert!(!slot.is_available());
        assert!(!slot.reserve());
    }

    #[tokio::test]
    async fn apply_records_active_session() {
        let (slot, _) = slot(false);
        slot.reserve();

        let active = slot.apply(chrome()).await.unwrap();
        assert_eq!(active.id().as_str(), "s1");
        assert!(slot.active().await.is_some());
    }

    #[tokio::test]
    async fn apply_rejects_mismatched_capabilities() {
        let (slot, _) = slot(false);
        slot.reserve();

        let request = CreateSessionRequest::new(Capabilities::new().with("browserName", "firefox"));
        let err = slot.apply(request).await.err().unwrap();
        assert!(!err.is_retryable());
        assert!(slot.active().await.is_none());
    }

    #[tokio::test]
    async fn apply_rejects_busy_slot() {
        let (slot, _) = slot(false);
        slot.reserve();
        slot.apply(chrome()).await.unwrap();

        let err = slot.apply(chrome()).await.err().unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn factory_failure_leaves_slot_empty() {
        let (slot, _) = slot(true);
        slot.reserve();
        assert!(slot.apply(chrome()).await.is_err());
        assert!(slot.active().await.is_none());
    }

    #[tokio::test]
    async fn stop_terminates_and_clears() {
        let (slot, stops) = slot(false);
        slot.reserve();
        slot.apply(chrome()).await.unwrap();

        slot.stop().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(slot.active().await.is_none());

        // Nothing left to stop.
        slot.stop().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_reflects_attached_session() {
        let (slot, _) = slot(false);
        assert!(slot.snapshot().await.session.is_none());

        slot.reserve();
        let active = slot.apply(chrome()).await.unwrap();
        slot.attach_session(Session {
            id: active.id().clone(),
            uri: active.uri().clone(),
            stereotype: slot.stereotype().clone(),
            capabilities: active.capabilities().clone(),
            start_time: active.start_time(),
        })
        .await;

        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.id, slot.id());
        assert_eq!(snapshot.session.unwrap().id.as_str(), "s1");

        slot.release().await;
        assert!(slot.is_available());
        assert!(slot.snapshot().await.session.is_none());
    }
}
