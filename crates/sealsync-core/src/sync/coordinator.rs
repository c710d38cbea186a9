//! Sync coordinator
//!
//! Owns one document's sync session: restores local state on startup,
//! captures local deltas into the op log, pushes them on a trailing-edge
//! throttle, applies peer deltas from the realtime stream, and compacts the
//! log into snapshots when the policy says so.
//!
//! Background work runs in three tasks per session (capture, throttled push
//! and realtime stream). They hold only a weak reference to the coordinator
//! state, so dropping the coordinator ends the session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::status::{LifecycleEvent, SyncEvent, SyncStatus};
use super::throttle::Throttle;
use crate::crypto::PayloadCipher;
use crate::document::{DocumentError, ListenerId, LocalChange, SyncDocument};
use crate::document_id::DocumentId;
use crate::error::{SyncError, SyncResult};
use crate::models::{AuthorId, Op, Snapshot, Timestamp, VersionMarker};
use crate::policy::SnapshotPolicy;
use crate::remote::{PeerDelta, PeerStream, PullResponse, RemoteChannel, RemoteOp, RemoteSnapshot};
use crate::storage::meta::keys;
use crate::storage::LocalStore;

/// Minimum interval between throttled pushes
pub const PUSH_THROTTLE: Duration = Duration::from_millis(2000);

/// Local deltas waiting to be written to the op log
///
/// The document listener only ever touches this queue, never the
/// coordinator itself.
struct CaptureQueue {
    /// A session is subscribed
    attached: AtomicBool,
    /// Auto-sync; cleared while remote state is being applied
    enabled: AtomicBool,
    pending: Mutex<VecDeque<LocalChange>>,
    notify: Notify,
}

impl CaptureQueue {
    fn new() -> Self {
        Self {
            attached: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn offer(&self, change: &LocalChange) {
        if !self.attached.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        self.pending.lock().push_back(change.clone());
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<LocalChange> {
        self.pending.lock().pop_front()
    }

    fn requeue(&self, change: LocalChange) {
        self.pending.lock().push_front(change);
    }

    /// Disable capture until the returned guard is dropped
    fn suppress(&self) -> SuppressCapture<'_> {
        let previous = self.enabled.swap(false, Ordering::SeqCst);
        SuppressCapture {
            queue: self,
            previous,
        }
    }
}

/// Restores the auto-sync flag on every exit path
struct SuppressCapture<'a> {
    queue: &'a CaptureQueue,
    previous: bool,
}

impl Drop for SuppressCapture<'_> {
    fn drop(&mut self) {
        self.queue.enabled.store(self.previous, Ordering::SeqCst);
    }
}

struct Session {
    listener: ListenerId,
    throttle: Arc<Throttle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn stop(self) {
        self.throttle.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// How a push reacts to another push already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    /// Skip; the in-flight push reschedules once it is done
    Coalesce,
    /// Wait for the in-flight push, then push again
    Wait,
}

/// What the local store restored during bootstrap
#[derive(Debug, Default)]
struct Restored {
    snapshot_applied: bool,
    /// Acknowledged ops still in the log
    history: usize,
    unpushed: usize,
}

impl Restored {
    fn usable(&self) -> bool {
        self.snapshot_applied || self.history > 0 || self.unpushed > 0
    }
}

struct Inner<D: SyncDocument> {
    document_id: DocumentId,
    author_id: AuthorId,
    doc: Arc<tokio::sync::Mutex<D>>,
    store: LocalStore,
    remote: Option<Arc<dyn RemoteChannel>>,
    cipher: Arc<dyn PayloadCipher>,
    policy: SnapshotPolicy,
    throttle_interval: Duration,
    capture: Arc<CaptureQueue>,
    /// Keeps op log appends in capture order
    capture_lock: tokio::sync::Mutex<()>,
    /// Single-flight guard for pushes and compaction
    push_lock: tokio::sync::Mutex<()>,
    push_skipped: AtomicBool,
    status: watch::Sender<SyncStatus>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    snapshot_version: AtomicU64,
    last_synced: Mutex<Option<VersionMarker>>,
    /// Bumped on disconnect; completions from an older generation are dropped
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
}

/// Builder for [`SyncCoordinator`]
pub struct SyncCoordinatorBuilder<D: SyncDocument> {
    document_id: DocumentId,
    document: D,
    store: LocalStore,
    cipher: Arc<dyn PayloadCipher>,
    author_id: AuthorId,
    remote: Option<Arc<dyn RemoteChannel>>,
    policy: SnapshotPolicy,
    throttle_interval: Duration,
}

impl<D: SyncDocument> SyncCoordinatorBuilder<D> {
    /// Relay to sync with; without one the engine runs local-only
    pub fn with_remote(mut self, remote: Arc<dyn RemoteChannel>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn build(self) -> SyncCoordinator<D> {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            document_id: self.document_id,
            author_id: self.author_id,
            doc: Arc::new(tokio::sync::Mutex::new(self.document)),
            store: self.store,
            remote: self.remote,
            cipher: self.cipher,
            policy: self.policy,
            throttle_interval: self.throttle_interval,
            capture: Arc::new(CaptureQueue::new()),
            capture_lock: tokio::sync::Mutex::new(()),
            push_lock: tokio::sync::Mutex::new(()),
            push_skipped: AtomicBool::new(false),
            status,
            event_tx,
            snapshot_version: AtomicU64::new(0),
            last_synced: Mutex::new(None),
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
        };

        SyncCoordinator {
            inner: Arc::new(inner),
            event_rx: Some(event_rx),
        }
    }
}

/// Offline-first sync engine for one document
pub struct SyncCoordinator<D: SyncDocument> {
    inner: Arc<Inner<D>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl<D: SyncDocument> SyncCoordinator<D> {
    /// Start building a coordinator for `document`
    pub fn builder(
        document_id: DocumentId,
        document: D,
        store: LocalStore,
        cipher: Arc<dyn PayloadCipher>,
        author_id: impl Into<AuthorId>,
    ) -> SyncCoordinatorBuilder<D> {
        SyncCoordinatorBuilder {
            document_id,
            document,
            store,
            cipher,
            author_id: author_id.into(),
            remote: None,
            policy: SnapshotPolicy::default(),
            throttle_interval: PUSH_THROTTLE,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    pub fn author_id(&self) -> &AuthorId {
        &self.inner.author_id
    }

    /// Shared handle to the document
    ///
    /// Mutations made through it are captured like any other local change
    /// while a session is active.
    pub fn document(&self) -> Arc<tokio::sync::Mutex<D>> {
        self.inner.doc.clone()
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Get the current status
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.inner.snapshot_version.load(Ordering::SeqCst)
    }

    pub fn last_synced_version(&self) -> Option<VersionMarker> {
        self.inner.last_synced.lock().clone()
    }

    /// Whether any captured change has not been acknowledged by the relay
    pub fn has_unpushed_ops(&self) -> SyncResult<bool> {
        Ok(self.inner.store.has_unpushed(&self.inner.document_id)?)
    }

    /// Start the session: restore local state, then catch up with the relay
    ///
    /// Network failures are reported and swallowed when local state was
    /// restored; with nothing local to serve they are returned.
    pub async fn initialize(&self) -> SyncResult<()> {
        if self.is_initialized() {
            debug!("Coordinator for {} already initialized", self.inner.document_id);
            return Ok(());
        }

        let inner = &self.inner;
        info!("Initializing sync for {}", inner.document_id);
        inner.load_meta()?;
        self.start_session().await;

        let restored = match inner.restore_local().await {
            Ok(restored) => restored,
            Err(e) => {
                self.end_session().await;
                return Err(e);
            }
        };

        let Some(remote) = inner.remote.clone() else {
            debug!("No remote configured; running local-only");
            inner.set_status(SyncStatus::Idle);
            return Ok(());
        };

        match inner.bootstrap_remote(remote, restored.unpushed > 0).await {
            Ok(()) => {
                inner.set_status(SyncStatus::Idle);
                info!("Sync initialized for {}", inner.document_id);
                Ok(())
            }
            Err(e) if restored.usable() => {
                warn!(
                    "Relay unreachable during bootstrap of {}, continuing with local state: {}",
                    inner.document_id, e
                );
                inner.fail(&e);
                Ok(())
            }
            Err(e) => {
                warn!("Bootstrap of {} failed: {}", inner.document_id, e);
                inner.fail(&e);
                self.end_session().await;
                Err(e)
            }
        }
    }

    /// Tear down the session; the coordinator can be initialized again
    ///
    /// Changes already queued by the document are persisted first.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let captured = self.inner.capture_pending().await;
        if self.end_session().await {
            self.inner.set_status(SyncStatus::Idle);
            info!("Disconnected sync for {}", self.inner.document_id);
        }
        captured.map(|_| ())
    }

    /// Mutate the document; returns once the resulting ops are durable
    pub async fn change<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut D) -> Result<T, DocumentError>,
    {
        if !self.is_initialized() {
            return Err(SyncError::NotInitialized);
        }

        let result = {
            let mut doc = self.inner.doc.lock().await;
            f(&mut *doc)?
        };
        self.inner.capture_pending().await?;
        Ok(result)
    }

    /// Push now instead of waiting for the throttle
    pub async fn force_sync(&self) -> SyncResult<()> {
        let throttle = self.inner.throttle().ok_or(SyncError::NotInitialized)?;
        self.inner.capture_pending().await?;
        throttle.cancel();
        self.inner.push_to_server(PushMode::Wait).await
    }

    /// Compact the op log into a snapshot now
    pub async fn create_snapshot(&self) -> SyncResult<()> {
        let remote = self.inner.remote.clone().ok_or(SyncError::NoRemote)?;
        let _flight = self.inner.push_lock.lock().await;
        self.inner.create_and_push_snapshot(remote.as_ref()).await
    }

    /// React to a host lifecycle signal
    ///
    /// Returns `true` when the host should warn that changes have not
    /// reached the relay yet.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> SyncResult<bool> {
        let Some(throttle) = self.inner.throttle() else {
            return Ok(false);
        };
        let inner = &self.inner;

        match event {
            LifecycleEvent::Hidden => {
                if throttle.cancel() {
                    debug!("Flushing throttled push for {}", inner.document_id);
                    if let Err(e) = inner.push_to_server(PushMode::Wait).await {
                        debug!("Flush on hide failed: {}", e);
                    }
                }
                Ok(false)
            }
            LifecycleEvent::Terminating => {
                inner.capture_pending().await?;
                if !inner.store.has_unpushed(&inner.document_id)? {
                    return Ok(false);
                }

                throttle.cancel();
                if let Err(e) = inner.push_to_server(PushMode::Wait).await {
                    debug!("Flush on terminate failed: {}", e);
                }
                warn!("Terminating with unpushed changes for {}", inner.document_id);
                inner.emit(SyncEvent::UnsavedChanges);
                Ok(true)
            }
        }
    }

    async fn start_session(&self) {
        let inner = &self.inner;
        let queue = inner.capture.clone();
        let listener = {
            let sink = queue.clone();
            let mut doc = inner.doc.lock().await;
            doc.subscribe_local_changes(Box::new(move |change: &LocalChange| sink.offer(change)))
        };
        queue.attached.store(true, Ordering::SeqCst);

        let (throttle, ticks) = Throttle::new(inner.throttle_interval);
        let weak = Arc::downgrade(inner);
        let tasks = vec![
            tokio::spawn(run_capture(weak.clone(), queue)),
            tokio::spawn(run_push_driver(weak, ticks)),
        ];

        *inner.session.lock() = Some(Session {
            listener,
            throttle: Arc::new(throttle),
            tasks,
        });
    }

    /// Returns whether a session was running
    async fn end_session(&self) -> bool {
        let session = self.inner.session.lock().take();
        let Some(session) = session else {
            return false;
        };

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.capture.attached.store(false, Ordering::SeqCst);
        let listener = session.listener;
        session.stop();
        self.inner
            .doc
            .lock()
            .await
            .unsubscribe_local_changes(listener);
        true
    }
}

impl<D: SyncDocument> Inner<D> {
    fn set_status(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Sync status for {}: {} -> {}", self.document_id, previous, status);
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn fail(&self, error: &SyncError) {
        self.set_status(SyncStatus::Error);
        self.emit(SyncEvent::Error(error.to_string()));
    }

    fn throttle(&self) -> Option<Arc<Throttle>> {
        self.session.lock().as_ref().map(|s| s.throttle.clone())
    }

    fn load_meta(&self) -> SyncResult<()> {
        if let Some(raw) = self.store.get_meta(&self.document_id, keys::SNAPSHOT_VERSION)? {
            match raw.parse::<u64>() {
                Ok(version) => self.snapshot_version.store(version, Ordering::SeqCst),
                Err(_) => warn!("Ignoring unreadable snapshot version '{}'", raw),
            }
        }

        if let Some(raw) = self.store.get_meta(&self.document_id, keys::LAST_SYNCED_VERSION)? {
            match VersionMarker::from_base64(&raw) {
                Ok(marker) => *self.last_synced.lock() = Some(marker),
                Err(e) => warn!("Ignoring unreadable last synced version: {}", e),
            }
        }
        Ok(())
    }

    /// Write every queued local change to the op log, in order
    async fn capture_pending(&self) -> SyncResult<usize> {
        let _order = self.capture_lock.lock().await;

        let mut captured = 0;
        while let Some(change) = self.capture.pop() {
            if let Err(e) = self.append_change(&change) {
                self.capture.requeue(change);
                return Err(e);
            }
            captured += 1;
        }

        if captured > 0 {
            debug!("Captured {} local changes for {}", captured, self.document_id);
            self.set_status(SyncStatus::Saving);
            if let Some(throttle) = self.throttle() {
                throttle.schedule();
            }
        }
        Ok(captured)
    }

    fn append_change(&self, change: &LocalChange) -> SyncResult<()> {
        let ciphertext = self.cipher.encrypt(&change.delta)?;
        let op = Op::new(
            self.document_id,
            change.version.clone(),
            ciphertext,
            self.store.next_timestamp(),
        );
        self.store.append_op(&op)?;
        Ok(())
    }

    /// Local half of bootstrap: snapshot, acknowledged history, unpushed ops
    ///
    /// Every acknowledged op still in the log is re-applied, not only those
    /// newer than the snapshot: an adopted relay snapshot may lack some of
    /// them, and deltas already folded in apply as no-ops.
    async fn restore_local(&self) -> SyncResult<Restored> {
        let mut restored = Restored::default();

        if let Some(snapshot) = self.store.load_snapshot(&self.document_id)? {
            match self.cipher.decrypt(&snapshot.ciphertext) {
                Ok(plaintext) => {
                    let mut doc = self.doc.lock().await;
                    let _quiet = self.capture.suppress();
                    doc.apply_snapshot(&plaintext)?;
                    restored.snapshot_applied = true;
                    debug!("Applied local snapshot for {}", self.document_id);
                }
                Err(e) => {
                    warn!("Local snapshot for {} rejected: {}", self.document_id, e);
                    self.emit(SyncEvent::Error(format!("local snapshot rejected: {}", e)));
                }
            }
        }

        let acknowledged: Vec<Op> = self
            .store
            .ops_since(&self.document_id, Timestamp::MIN)?
            .into_iter()
            .filter(|op| op.pushed)
            .collect();
        if !acknowledged.is_empty() {
            let applied = self.apply_logged(&acknowledged).await;
            debug!(
                "Re-applied {}/{} acknowledged ops for {}",
                applied,
                acknowledged.len(),
                self.document_id
            );
            restored.history = acknowledged.len();
        }

        restored.unpushed = self.replay_unpushed().await?;
        Ok(restored)
    }

    /// Re-apply unpushed ops without capturing them again
    async fn replay_unpushed(&self) -> SyncResult<usize> {
        let ops = self.store.unpushed_ops(&self.document_id)?;
        if ops.is_empty() {
            return Ok(0);
        }

        let applied = self.apply_logged(&ops).await;
        info!(
            "Replayed {}/{} unpushed ops for {}",
            applied,
            ops.len(),
            self.document_id
        );
        Ok(ops.len())
    }

    /// Decrypt and apply logged ops in order with capture suppressed
    ///
    /// A bad op is reported and skipped; the rest still apply.
    async fn apply_logged(&self, ops: &[Op]) -> usize {
        let mut doc = self.doc.lock().await;
        let _quiet = self.capture.suppress();
        let mut applied = 0;
        for op in ops {
            let result = self
                .cipher
                .decrypt(&op.ciphertext)
                .map_err(SyncError::from)
                .and_then(|plaintext| doc.apply_delta(&plaintext).map_err(SyncError::from));
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Skipping logged op {}: {}", op.id, e);
                    self.emit(SyncEvent::Error(format!("op {} rejected: {}", op.id, e)));
                }
            }
        }
        applied
    }

    /// Relay half of bootstrap: subscribe, pull, push survivors
    async fn bootstrap_remote(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteChannel>,
        has_unpushed: bool,
    ) -> SyncResult<()> {
        self.set_status(SyncStatus::Syncing);

        let stream = remote.subscribe(&self.document_id).await?;
        let task = tokio::spawn(run_peer_stream(Arc::downgrade(self), stream));
        {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(session) => session.tasks.push(task),
                None => task.abort(),
            }
        }

        self.pull_remote(remote.as_ref(), has_unpushed).await?;

        if has_unpushed {
            let _flight = self.push_lock.lock().await;
            self.push_pending(remote.as_ref()).await?;
        }

        self.record_synced().await
    }

    async fn pull_remote(&self, remote: &dyn RemoteChannel, has_unpushed: bool) -> SyncResult<()> {
        let since = self.doc.lock().await.current_version_marker();
        let response = remote
            .pull_updates(&self.document_id, &since, has_unpushed)
            .await?;

        let snapshot_version = match response {
            PullResponse::Ops { ops } => {
                self.apply_remote_ops(&ops).await;
                return Ok(());
            }
            PullResponse::UseSnapshot { snapshot_version } => snapshot_version,
        };

        info!(
            "Relay asked {} to load snapshot version {}",
            self.document_id, snapshot_version
        );
        // Local ops captured from here on are not in the relay's snapshot
        let fetched_at = self.store.next_timestamp();
        let Some(snapshot) = remote.pull_snapshot(&self.document_id).await? else {
            warn!("Relay has no snapshot for {}", self.document_id);
            return Ok(());
        };

        let marker = snapshot.version_marker.clone();
        if !self
            .adopt_remote_snapshot(snapshot, snapshot_version, fetched_at)
            .await?
        {
            return Ok(());
        }

        // Ops the relay accepted after its snapshot
        match remote
            .pull_updates(&self.document_id, &marker, has_unpushed)
            .await?
        {
            PullResponse::Ops { ops } => self.apply_remote_ops(&ops).await,
            PullResponse::UseSnapshot { .. } => {
                debug!("Relay still diverged after snapshot for {}", self.document_id)
            }
        }
        Ok(())
    }

    /// Apply, persist and supersede the local snapshot with the relay's
    ///
    /// A snapshot that cannot be decrypted or applied is reported and
    /// skipped; returns whether it was adopted. Acknowledged local ops are
    /// kept since the relay's snapshot may predate them.
    async fn adopt_remote_snapshot(
        &self,
        snapshot: RemoteSnapshot,
        snapshot_version: u64,
        fetched_at: Timestamp,
    ) -> SyncResult<bool> {
        let applied = match self.cipher.decrypt(&snapshot.ciphertext) {
            Ok(plaintext) => {
                let mut doc = self.doc.lock().await;
                let _quiet = self.capture.suppress();
                doc.apply_snapshot(&plaintext).map_err(SyncError::from)
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = applied {
            warn!("Remote snapshot for {} rejected: {}", self.document_id, e);
            self.emit(SyncEvent::Error(format!("remote snapshot rejected: {}", e)));
            return Ok(false);
        }

        self.store.save_snapshot(&Snapshot {
            document_id: self.document_id,
            version_marker: snapshot.version_marker,
            ciphertext: snapshot.ciphertext,
            updated_at: fetched_at,
        })?;
        self.snapshot_version.store(snapshot_version, Ordering::SeqCst);
        self.store.set_meta(
            &self.document_id,
            keys::SNAPSHOT_VERSION,
            &snapshot_version.to_string(),
        )?;

        // Local edits the relay has not seen go back on top
        self.replay_unpushed().await?;
        self.emit(SyncEvent::RemoteUpdate);
        Ok(true)
    }

    async fn apply_remote_ops(&self, ops: &[RemoteOp]) {
        let mut applied = 0;
        for op in ops {
            match self.apply_remote_delta(&op.ciphertext).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Rejected remote op {}: {}", op.id, e);
                    self.emit(SyncEvent::Error(format!("remote op {} rejected: {}", op.id, e)));
                }
            }
        }

        if applied > 0 {
            debug!("Applied {} remote ops to {}", applied, self.document_id);
            self.emit(SyncEvent::RemoteUpdate);
        }
    }

    async fn apply_remote_delta(&self, ciphertext: &[u8]) -> SyncResult<()> {
        let plaintext = self.cipher.decrypt(ciphertext)?;
        let mut doc = self.doc.lock().await;
        let _quiet = self.capture.suppress();
        doc.apply_delta(&plaintext)?;
        Ok(())
    }

    async fn handle_peer_delta(&self, delta: PeerDelta) {
        if delta.author_id == self.author_id {
            debug!("Ignoring own delta echoed for {}", self.document_id);
            return;
        }

        match self.apply_remote_delta(&delta.ciphertext).await {
            Ok(()) => {
                debug!("Applied delta from {} to {}", delta.author_id, self.document_id);
                self.emit(SyncEvent::RemoteUpdate);
            }
            Err(e) => {
                warn!("Rejected delta from {}: {}", delta.author_id, e);
                self.emit(SyncEvent::Error(format!(
                    "delta from {} rejected: {}",
                    delta.author_id, e
                )));
            }
        }
    }

    /// Push unpushed ops, reporting the outcome through status and events
    async fn push_to_server(&self, mode: PushMode) -> SyncResult<()> {
        let Some(remote) = self.remote.clone() else {
            debug!("No remote configured; ops for {} stay local", self.document_id);
            self.set_status(SyncStatus::Idle);
            return Ok(());
        };

        let _flight = match mode {
            PushMode::Wait => self.push_lock.lock().await,
            PushMode::Coalesce => match self.push_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Push already in flight for {}", self.document_id);
                    self.push_skipped.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            },
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let result = self.push_pending(remote.as_ref()).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding push completion after disconnect");
            return result.map(|_| ());
        }

        match result {
            Ok(_) => {
                let throttle = self.throttle();
                if self.push_skipped.swap(false, Ordering::SeqCst)
                    && self.store.has_unpushed(&self.document_id)?
                {
                    if let Some(throttle) = &throttle {
                        throttle.schedule();
                    }
                }
                let pending = throttle.map(|t| t.is_pending()).unwrap_or(false);
                self.set_status(if pending {
                    SyncStatus::Saving
                } else {
                    SyncStatus::Idle
                });
                Ok(())
            }
            Err(e) => {
                warn!("Push for {} failed: {}", self.document_id, e);
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// One push cycle; caller holds the push lock
    async fn push_pending(&self, remote: &dyn RemoteChannel) -> SyncResult<usize> {
        let ops = self.store.unpushed_ops(&self.document_id)?;
        if ops.is_empty() {
            return Ok(0);
        }

        self.set_status(SyncStatus::Syncing);
        let batch: Vec<RemoteOp> = ops.iter().map(RemoteOp::from).collect();
        info!("Pushing {} ops for {}", batch.len(), self.document_id);

        let ack = remote.push_ops(&self.document_id, batch).await?;
        let accepted: Vec<_> = ack
            .accepted_ids
            .into_iter()
            .filter(|id| ops.iter().any(|op| &op.id == id))
            .collect();
        let marked = self.store.mark_pushed(&accepted)?;
        if accepted.len() < ops.len() {
            warn!(
                "Relay accepted {}/{} ops for {}",
                accepted.len(),
                ops.len(),
                self.document_id
            );
        }

        let stats = self.store.count_ops_since_snapshot(&self.document_id)?;
        if self.policy.should_compact_stats(stats) {
            info!(
                "Compacting {} ({} ops, {} bytes since last snapshot)",
                self.document_id, stats.count, stats.bytes
            );
            if let Err(e) = self.create_and_push_snapshot(remote).await {
                self.emit(SyncEvent::Error(format!("compaction failed: {}", e)));
            }
        }

        self.record_synced().await?;
        Ok(marked)
    }

    /// Compaction; caller holds the push lock
    async fn create_and_push_snapshot(&self, remote: &dyn RemoteChannel) -> SyncResult<()> {
        let version = self.snapshot_version.fetch_add(1, Ordering::SeqCst) + 1;

        match self.compact(remote, version).await {
            Ok(pruned) => {
                info!(
                    "Snapshot {} pushed for {}, pruned {} ops",
                    version, self.document_id, pruned
                );
                Ok(())
            }
            Err(e) => {
                self.snapshot_version.store(version - 1, Ordering::SeqCst);
                warn!("Compaction of {} failed: {}", self.document_id, e);
                Err(e)
            }
        }
    }

    async fn compact(&self, remote: &dyn RemoteChannel, version: u64) -> SyncResult<usize> {
        // Stamped under the lock so later edits sort after the snapshot
        let (plaintext, version_marker, updated_at) = {
            let mut doc = self.doc.lock().await;
            (
                doc.export_snapshot()?,
                doc.current_version_marker(),
                self.store.next_timestamp(),
            )
        };
        let ciphertext = self.cipher.encrypt(&plaintext)?;

        remote
            .push_snapshot(
                &self.document_id,
                RemoteSnapshot {
                    ciphertext: ciphertext.clone(),
                    version_marker: version_marker.clone(),
                },
            )
            .await?;

        self.store.save_snapshot(&Snapshot {
            document_id: self.document_id,
            version_marker,
            ciphertext,
            updated_at,
        })?;
        let pruned = self.store.prune_pushed_before(&self.document_id, updated_at)?;
        self.store.set_meta(
            &self.document_id,
            keys::SNAPSHOT_VERSION,
            &version.to_string(),
        )?;
        Ok(pruned)
    }

    async fn record_synced(&self) -> SyncResult<()> {
        let marker = self.doc.lock().await.current_version_marker();
        self.store.set_meta(
            &self.document_id,
            keys::LAST_SYNCED_VERSION,
            &marker.to_base64(),
        )?;
        *self.last_synced.lock() = Some(marker);
        Ok(())
    }
}

impl<D: SyncDocument> Drop for Inner<D> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}

async fn run_capture<D: SyncDocument>(inner: Weak<Inner<D>>, queue: Arc<CaptureQueue>) {
    loop {
        queue.notify.notified().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.capture_pending().await {
            warn!("Failed to persist local change: {}", e);
            inner.fail(&e);
        }
    }
}

async fn run_push_driver<D: SyncDocument>(
    inner: Weak<Inner<D>>,
    mut ticks: mpsc::UnboundedReceiver<()>,
) {
    while ticks.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.push_to_server(PushMode::Coalesce).await {
            debug!("Throttled push failed: {}", e);
        }
    }
}

async fn run_peer_stream<D: SyncDocument>(inner: Weak<Inner<D>>, mut stream: PeerStream) {
    while let Some(delta) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_peer_delta(delta).await;
    }
    debug!("Realtime stream ended");
}
