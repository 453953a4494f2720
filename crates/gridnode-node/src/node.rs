//! Node — the scheduler that hands out slots and reclaims them.
//!
//! The `Node` is the control point that:
//! - Picks and reserves a free matching slot for each new-session request
//! - Registers live sessions with an idle timeout and evicts them
//! - Owns per-session upload and download directories
//! - Drains, and reports status for heartbeats and health checks
//!
//! # Locking
//!
//! The pool lock guards slot selection and every change to the reserved
//! count. Nothing that can block on I/O runs while it is held. Session
//! start, downstream termination and filesystem cleanup all happen after
//! it is released.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use gridnode_core::capabilities::DOWNLOADS_ENABLED;
use gridnode_core::config::NodeSection;
use gridnode_core::{
    Availability, Capabilities, CloseReason, Command, CommandResponse, CoreResult,
    CreateSessionRequest, DefaultSlotMatcher, EventBus, NewSessionResponse, NodeEvent, NodeId,
    NodeStatus, OsInfo, RequestId, Session, SessionId, SlotId, SlotMatcher,
};

use crate::cache::ExpiringCache;
use crate::downloads::with_downloads_directory;
use crate::error::{NewSessionError, NodeError, NodeResult};
use crate::external::{ProtocolSupport, external_session};
use crate::factory::SessionFactory;
use crate::slot::SessionSlot;
use crate::tempfs::{TempFsRegistry, TemporaryFilesystem};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tunables for a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Address the grid reaches this node on.
    pub external_uri: Url,
    /// Public address used when rewriting CDP/BiDi/VNC endpoints.
    pub grid_uri: Url,
    /// Session cap. `None` means one per slot.
    pub max_sessions: Option<usize>,
    /// Idle time after which a session is evicted.
    pub session_timeout: Duration,
    pub heartbeat_period: Duration,
    pub sweep_period: Duration,
    /// Drain after this many successful session starts. 0 disables.
    pub drain_after_session_count: u64,
    pub enable_cdp: bool,
    pub enable_bidi: bool,
    pub enable_managed_downloads: bool,
    /// Parent of the upload and download directories.
    pub tmp_dir: PathBuf,
}

impl NodeOptions {
    pub fn new(external_uri: Url) -> Self {
        Self {
            grid_uri: external_uri.clone(),
            external_uri,
            max_sessions: None,
            session_timeout: Duration::from_secs(300),
            heartbeat_period: Duration::from_secs(60),
            sweep_period: Duration::from_secs(30),
            drain_after_session_count: 0,
            enable_cdp: true,
            enable_bidi: true,
            enable_managed_downloads: false,
            tmp_dir: std::env::temp_dir(),
        }
    }

    pub fn from_config(section: &NodeSection) -> CoreResult<Self> {
        Ok(Self {
            external_uri: section.external_uri()?,
            grid_uri: section.grid_uri()?,
            max_sessions: section.max_sessions,
            session_timeout: section.session_timeout()?,
            heartbeat_period: section.heartbeat_period()?,
            sweep_period: section.sweep_period()?,
            drain_after_session_count: section.drain_after_session_count,
            enable_cdp: section.enable_cdp,
            enable_bidi: section.enable_bidi,
            enable_managed_downloads: section.enable_managed_downloads,
            tmp_dir: section.tmp_dir.clone().unwrap_or_else(std::env::temp_dir),
        })
    }
}

/// Assembles a [`Node`] from its slots.
pub struct NodeBuilder {
    id: NodeId,
    options: NodeOptions,
    bus: Arc<dyn EventBus>,
    matcher: Arc<dyn SlotMatcher>,
    slots: Vec<(Capabilities, Arc<dyn SessionFactory>)>,
}

impl NodeBuilder {
    pub fn new(options: NodeOptions, bus: Arc<dyn EventBus>) -> Self {
        Self {
            id: NodeId::new(),
            options,
            bus,
            matcher: Arc::new(DefaultSlotMatcher),
            slots: Vec::new(),
        }
    }

    pub fn node_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Add one slot. Slots are scanned in the order they are added.
    pub fn add(mut self, stereotype: Capabilities, factory: Arc<dyn SessionFactory>) -> Self {
        self.slots.push((stereotype, factory));
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn SlotMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn build(self) -> Node {
        let slots: Vec<Arc<SessionSlot>> = self
            .slots
            .into_iter()
            .map(|(stereotype, factory)| {
                Arc::new(SessionSlot::new(
                    SlotId::new(self.id),
                    stereotype,
                    factory,
                    Arc::clone(&self.matcher),
                ))
            })
            .collect();

        let max_sessions = self
            .options
            .max_sessions
            .map_or(slots.len(), |max| max.min(slots.len()));
        let sessions_until_drain = (self.options.drain_after_session_count > 0)
            .then(|| AtomicU64::new(self.options.drain_after_session_count));

        let tmp_dir = self.options.tmp_dir.clone();
        info!(
            node_id = %self.id,
            slots = slots.len(),
            max_sessions,
            external_uri = %self.options.external_uri,
            "node built"
        );

        Node {
            id: self.id,
            max_sessions,
            bus: self.bus,
            slots: Mutex::new(slots),
            sessions: Mutex::new(ExpiringCache::new(Some(self.options.session_timeout))),
            uploads: Mutex::new(TempFsRegistry::new(&tmp_dir, "uploads-")),
            downloads: Mutex::new(TempFsRegistry::new(&tmp_dir, "downloads-")),
            options: self.options,
            draining: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            pending_drain: AtomicUsize::new(0),
            drain_complete_sent: AtomicBool::new(false),
            sessions_until_drain,
        }
    }
}

/// What the session registry remembers about a live session.
struct SessionEntry {
    slot: Arc<SessionSlot>,
    /// Key of the managed downloads directory, if one was created.
    downloads: Option<Uuid>,
}

/// A successfully started session and its client-facing response body.
#[derive(Debug, Clone)]
pub struct CreateSessionResponse {
    pub session: Session,
    /// New-session response encoded in the client's dialect.
    pub downstream_encoded_response: Vec<u8>,
}

impl CreateSessionResponse {
    pub fn into_new_session_response(self, request_id: RequestId) -> NewSessionResponse {
        NewSessionResponse {
            request_id,
            session: self.session,
            downstream_encoded_response: self.downstream_encoded_response,
        }
    }
}

pub struct Node {
    id: NodeId,
    options: NodeOptions,
    max_sessions: usize,
    bus: Arc<dyn EventBus>,
    /// The pool lock.
    slots: Mutex<Vec<Arc<SessionSlot>>>,
    sessions: Mutex<ExpiringCache<SessionId, Arc<SessionEntry>>>,
    uploads: Mutex<TempFsRegistry<SessionId>>,
    downloads: Mutex<TempFsRegistry<Uuid>>,
    draining: AtomicBool,
    /// Reserved slots: live sessions plus starts in flight.
    in_use: AtomicUsize,
    /// Releases still owed before drain completes.
    pending_drain: AtomicUsize,
    drain_complete_sent: AtomicBool,
    sessions_until_drain: Option<AtomicU64>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Start a session on the first free slot that matches the request.
    pub async fn new_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, NewSessionError> {
        if self.in_use.load(Ordering::SeqCst) >= self.max_sessions {
            return Err(NewSessionError::MaxSessionsReached(self.max_sessions));
        }
        if self.is_draining() {
            return Err(NewSessionError::Draining);
        }

        let slot = self.reserve_slot(&request.desired_capabilities).await?;
        debug!(node_id = %self.id, slot = %slot.id(), "slot reserved");

        let mut capabilities = request.desired_capabilities.clone();
        let mut downloads = None;
        if self.options.enable_managed_downloads && capabilities.is_enabled(DOWNLOADS_ENABLED) {
            let key = Uuid::new_v4();
            let created = self.downloads.lock().await.create(key);
            match created {
                Ok(dir) => {
                    capabilities = with_downloads_directory(&capabilities, &dir);
                    downloads = Some(key);
                }
                Err(e) => {
                    error!(slot = %slot.id(), error = %e, "failed to create downloads directory");
                    self.release_slot(&slot).await;
                    return Err(e.into());
                }
            }
        }

        let active = match slot.apply(request.with_capabilities(capabilities.clone())).await {
            Ok(active) => active,
            Err(e) => {
                warn!(slot = %slot.id(), error = %e, retryable = e.is_retryable(), "session creation failed");
                if let Some(key) = downloads {
                    self.remove_downloads(&key).await;
                }
                self.release_slot(&slot).await;
                return Err(e);
            }
        };

        let session = external_session(
            active.as_ref(),
            &capabilities,
            slot.stereotype(),
            &self.options.external_uri,
            &self.options.grid_uri,
            ProtocolSupport {
                cdp_enabled: self.options.enable_cdp,
                bidi_enabled: self.options.enable_bidi,
                slot_supports_cdp: slot.supports_cdp(),
                slot_supports_bidi: slot.supports_bidi(),
            },
        );
        let encoded = active
            .downstream_dialect()
            .encode_new_session(&session.id, &session.capabilities);

        let entry = Arc::new(SessionEntry {
            slot: Arc::clone(&slot),
            downloads,
        });
        let registered = {
            let mut sessions = self.sessions.lock().await;
            let registered = sessions.try_insert(session.id.clone(), entry).is_ok();
            // Attached under the registry lock: a session visible in status
            // is already reachable by id.
            if registered {
                slot.attach_session(session.clone()).await;
            }
            registered
        };
        if !registered {
            error!(session_id = %session.id, slot = %slot.id(), "factory returned a session id already in use");
            slot.stop().await;
            if let Some(key) = downloads {
                self.remove_downloads(&key).await;
            }
            self.release_slot(&slot).await;
            return Err(NewSessionError::not_created(format!(
                "session id {} is already in use",
                session.id
            )));
        }

        info!(
            session_id = %session.id,
            slot = %slot.id(),
            browser = session.capabilities.browser_name().unwrap_or(""),
            "session created"
        );

        if self.count_towards_drain() {
            info!(node_id = %self.id, "session limit reached, draining");
            self.drain().await;
        }

        Ok(CreateSessionResponse {
            session,
            downstream_encoded_response: encoded,
        })
    }

    /// Scan in slot order and reserve the first free match.
    async fn reserve_slot(
        &self,
        capabilities: &Capabilities,
    ) -> Result<Arc<SessionSlot>, NewSessionError> {
        let slots = self.slots.lock().await;
        // Re-checked under the lock: drain and other reservations serialize here.
        if self.in_use.load(Ordering::SeqCst) >= self.max_sessions {
            return Err(NewSessionError::MaxSessionsReached(self.max_sessions));
        }
        if self.is_draining() {
            return Err(NewSessionError::Draining);
        }

        let slot = slots
            .iter()
            .find(|slot| slot.is_available() && slot.test(capabilities))
            .ok_or_else(|| NewSessionError::NoSlotMatched(capabilities.clone()))?;

        if !slot.reserve() {
            return Err(NewSessionError::retry("slot was reserved concurrently"));
        }
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(slot))
    }

    /// Return a reserved slot to the pool, settling drain accounting.
    async fn release_slot(&self, slot: &SessionSlot) {
        let drained = {
            let _pool = self.slots.lock().await;
            slot.release().await;
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            self.is_draining()
                && self
                    .pending_drain
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    == Ok(1)
        };
        debug!(slot = %slot.id(), "slot released");
        if drained {
            self.complete_drain();
        }
    }

    /// Decrement the drain-after-N counter. True when it just hit zero.
    fn count_towards_drain(&self) -> bool {
        match &self.sessions_until_drain {
            Some(remaining) => {
                remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    == Ok(1)
            }
            None => false,
        }
    }

    /// Terminate a session on request.
    pub async fn stop(&self, id: &SessionId) -> NodeResult<()> {
        let entry = self
            .sessions
            .lock()
            .await
            .invalidate(id)
            .ok_or_else(|| NodeError::NoSuchSession(id.clone()))?;
        self.evict(id.clone(), entry, CloseReason::Stopped).await;
        Ok(())
    }

    /// Reclaim everything a session held. Runs after the registry entry
    /// is gone.
    async fn evict(&self, id: SessionId, entry: Arc<SessionEntry>, reason: CloseReason) {
        if reason == CloseReason::Timeout {
            if let Some(active) = entry.slot.active().await {
                match active.execute(Command::delete_session(&id)).await {
                    Ok(response) if response.is_success() => {
                        debug!(session_id = %id, "timed out session terminated downstream");
                    }
                    Ok(response) => {
                        warn!(session_id = %id, status = response.status, "downstream refused to terminate timed out session");
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "failed to terminate timed out session");
                    }
                }
            }
        }

        entry.slot.stop().await;

        let uploads = self.uploads.lock().await.take(&id);
        if let Some(dir) = uploads {
            if let Err(e) = delete_dir(dir).await {
                error!(session_id = %id, error = %e, "failed to delete uploads directory");
            }
        }
        if let Some(key) = entry.downloads {
            self.remove_downloads(&key).await;
        }

        info!(session_id = %id, slot = %entry.slot.id(), ?reason, "session evicted");
        self.bus.publish(NodeEvent::SessionClosed {
            session_id: id,
            reason,
        });
        self.release_slot(&entry.slot).await;
    }

    async fn remove_downloads(&self, key: &Uuid) {
        let dir = self.downloads.lock().await.take(key);
        if let Some(dir) = dir {
            if let Err(e) = delete_dir(dir).await {
                error!(downloads = %key, error = %e, "failed to delete downloads directory");
            }
        }
    }

    /// The grid-facing view of a live session. Refreshes its idle timer.
    pub async fn get_session(&self, id: &SessionId) -> NodeResult<Session> {
        let entry = self.entry(id).await?;
        entry
            .slot
            .session()
            .await
            .ok_or_else(|| NodeError::NoSuchSession(id.clone()))
    }

    pub async fn is_session_owner(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Forward a WebDriver command to the session's driver.
    ///
    /// A `DELETE /session/{id}` is forwarded first, then the session is
    /// stopped.
    pub async fn execute_command(
        &self,
        id: &SessionId,
        command: Command,
    ) -> NodeResult<CommandResponse> {
        let entry = self.entry(id).await?;
        let active = entry
            .slot
            .active()
            .await
            .ok_or_else(|| NodeError::NoSuchSession(id.clone()))?;

        let ends_session =
            command.is_delete_session() && command.session_id().as_ref() == Some(id);
        let response = active.execute(command).await?;

        if ends_session {
            match self.stop(id).await {
                // Swept while the delete was in flight.
                Ok(()) | Err(NodeError::NoSuchSession(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }

    /// Stage an uploaded file in the session's upload directory.
    pub async fn upload_file(
        &self,
        id: &SessionId,
        file_name: &str,
        contents: &[u8],
    ) -> NodeResult<PathBuf> {
        validate_file_name(file_name)?;

        let dir = {
            let mut uploads = self.uploads.lock().await;
            // Under the uploads lock, so an eviction either sees this
            // directory or happens before the check.
            self.entry(id).await?;
            uploads.get_or_create(id.clone())?
        };
        let path = dir.join(file_name);
        tokio::fs::write(&path, contents).await?;
        debug!(session_id = %id, path = ?path, bytes = contents.len(), "file uploaded");
        Ok(path)
    }

    /// Names of the files the browser has downloaded, sorted.
    pub async fn list_downloads(&self, id: &SessionId) -> NodeResult<Vec<String>> {
        let dir = self.downloads_dir(id).await?;
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn download_file(&self, id: &SessionId, file_name: &str) -> NodeResult<Vec<u8>> {
        validate_file_name(file_name)?;
        let dir = self.downloads_dir(id).await?;
        Ok(tokio::fs::read(dir.join(file_name)).await?)
    }

    async fn downloads_dir(&self, id: &SessionId) -> NodeResult<PathBuf> {
        let entry = self.entry(id).await?;
        let key = entry
            .downloads
            .ok_or_else(|| NodeError::DownloadsNotEnabled(id.clone()))?;
        self.downloads
            .lock()
            .await
            .get(&key)
            .ok_or_else(|| NodeError::DownloadsNotEnabled(id.clone()))
    }

    async fn entry(&self, id: &SessionId) -> NodeResult<Arc<SessionEntry>> {
        self.sessions
            .lock()
            .await
            .get(id)
            .ok_or_else(|| NodeError::NoSuchSession(id.clone()))
    }

    /// Stop accepting sessions. Completion is announced once every slot
    /// reserved at this point has been released.
    pub async fn drain(&self) {
        let pending = {
            let _pool = self.slots.lock().await;
            if self.draining.swap(true, Ordering::SeqCst) {
                debug!(node_id = %self.id, "drain already in progress");
                return;
            }
            let pending = self.in_use.load(Ordering::SeqCst);
            self.pending_drain.store(pending, Ordering::SeqCst);
            self.bus.publish(NodeEvent::DrainStarted(self.id));
            pending
        };

        info!(node_id = %self.id, pending, "drain started");
        if pending == 0 {
            self.complete_drain();
        }
    }

    fn complete_drain(&self) {
        if self.drain_complete_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.id, "drain complete");
        self.bus.publish(NodeEvent::DrainComplete(self.id));
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Whether `DrainComplete` has been published.
    pub fn is_drained(&self) -> bool {
        self.drain_complete_sent.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.bus.is_ready()
    }

    /// Sessions in the registry, including idle ones not yet swept.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// A fresh snapshot of the node.
    pub async fn status(&self) -> NodeStatus {
        let slots = self.slots.lock().await.clone();

        let mut snapshots = Vec::with_capacity(slots.len());
        let mut down = false;
        for slot in &slots {
            snapshots.push(slot.snapshot().await);
            down |= !slot.is_factory_available();
        }

        let availability = if down {
            Availability::Down
        } else if self.is_draining() {
            Availability::Draining
        } else {
            Availability::Up
        };

        NodeStatus {
            node_id: self.id,
            external_uri: self.options.external_uri.clone(),
            max_session_count: self.max_sessions,
            slots: snapshots,
            availability,
            heartbeat_period: self.options.heartbeat_period,
            version: VERSION.to_string(),
            os_info: OsInfo::current(),
        }
    }

    /// Evict every session idle past the timeout. Returns how many.
    pub async fn sweep_sessions(&self) -> usize {
        let expired = self.sessions.lock().await.sweep_expired(Instant::now());
        let count = expired.len();
        for (id, entry) in expired {
            self.evict(id, entry, CloseReason::Timeout).await;
        }
        if count > 0 {
            debug!(count, "idle sessions swept");
        }
        count
    }

    pub async fn sweep_uploads(&self) -> usize {
        self.uploads.lock().await.cleanup()
    }

    pub async fn sweep_downloads(&self) -> usize {
        self.downloads.lock().await.cleanup()
    }

    /// Publish the current status.
    pub async fn heartbeat(&self) {
        let status = self.status().await;
        debug!(
            node_id = %self.id,
            availability = ?status.availability,
            sessions = status.session_count(),
            "heartbeat"
        );
        self.bus.publish(NodeEvent::Heartbeat(status));
    }
}

/// Delete a directory taken out of a registry on the blocking pool.
async fn delete_dir(dir: Arc<TemporaryFilesystem>) -> io::Result<()> {
    match tokio::task::spawn_blocking(move || dir.delete()).await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// A bare file name: no separators, no parent references.
fn validate_file_name(name: &str) -> NodeResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(NodeError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_validated() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a\\b").is_err());
    }

    #[test]
    fn options_from_config() {
        let config = gridnode_core::NodeConfig::from_toml(
            r#"
[node]
external_uri = "http://10.0.0.5:5555"
grid_uri = "https://grid.example.com"
session_timeout = "10s"
drain_after_session_count = 3
"#,
        )
        .unwrap();
        let options = NodeOptions::from_config(&config.node).unwrap();
        assert_eq!(options.session_timeout, Duration::from_secs(10));
        assert_eq!(options.grid_uri.scheme(), "https");
        assert_eq!(options.drain_after_session_count, 3);
        assert_eq!(options.tmp_dir, std::env::temp_dir());
    }

    #[test]
    fn max_sessions_is_clamped_to_slot_count() {
        struct Never;
        impl SessionFactory for Never {
            fn apply(
                &self,
                _request: CreateSessionRequest,
            ) -> crate::factory::BoxFuture<
                '_,
                Result<Box<dyn crate::factory::ActiveSession>, NewSessionError>,
            > {
                Box::pin(async { Err(NewSessionError::not_created("never")) })
            }
        }

        let mut options = NodeOptions::new(Url::parse("http://localhost:5555").unwrap());
        options.max_sessions = Some(10);
        let bus = Arc::new(gridnode_core::LocalEventBus::default());
        let node = NodeBuilder::new(options, bus)
            .add(Capabilities::new().with("browserName", "chrome"), Arc::new(Never))
            .build();
        assert_eq!(node.max_sessions(), 1);
    }
}
