//! Relay channel registry — connected workers, busy flags and correlation slots.
//!
//! All mutable relay state sits behind one short-held mutex. A worker's busy
//! flag is set in the same critical section that creates its slot and cleared
//! in the same one that removes it, so two dispatches can never claim the
//! same idle worker and a worker can never stay busy after its slot is gone.
//! Nobody awaits while holding the lock: the HTTP side waits on its slot's
//! channel, the transport side on its socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arenabridge_core::{BusyPolicy, Error, Result, TimeoutPhase};
use arenabridge_pool::SessionPool;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::capture::{CaptureCoordinator, CaptureRequest, CaptureTicket};
use crate::protocol::*;
use crate::update::UpdateCoordinator;

/// Outbound half of a worker's transport loop.
pub type WorkerSender = mpsc::UnboundedSender<Envelope>;

type SlotMessage = Result<RelayEvent>;

/// Tunables for dispatch and correlation deadlines.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub busy_policy: BusyPolicy,
    pub busy_wait: Duration,
    pub first_event_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::Wait,
            busy_wait: Duration::from_secs(60),
            first_event_timeout: Duration::from_secs(360),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&arenabridge_core::BridgeConfig> for RelayOptions {
    fn from(config: &arenabridge_core::BridgeConfig) -> Self {
        Self {
            busy_policy: config.busy_policy,
            busy_wait: config.busy_wait(),
            first_event_timeout: config.first_event_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Which worker a command should go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTarget {
    /// Most recently active idle worker.
    AnyAvailable,
    Worker(WorkerId),
}

struct WorkerEntry {
    tx: WorkerSender,
    busy: Option<CorrelationKey>,
    connected_at: chrono::DateTime<chrono::Utc>,
    last_active: Instant,
    client: Option<String>,
}

struct SlotEntry {
    worker: WorkerId,
    created_at: Instant,
    sink: mpsc::UnboundedSender<SlotMessage>,
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<WorkerId, WorkerEntry>,
    slots: HashMap<CorrelationKey, SlotEntry>,
}

impl RegistryInner {
    /// Drop a slot and free its worker. Returns the slot if it existed.
    fn release(&mut self, key: &CorrelationKey) -> Option<SlotEntry> {
        let slot = self.slots.remove(key)?;
        if let Some(worker) = self.workers.get_mut(&slot.worker) {
            if worker.busy.as_ref() == Some(key) {
                worker.busy = None;
            }
            worker.last_active = Instant::now();
        }
        Some(slot)
    }

    /// Idle workers, most recently active first.
    fn idle_workers(&self) -> Vec<WorkerId> {
        let mut idle: Vec<(&WorkerId, &WorkerEntry)> = self
            .workers
            .iter()
            .filter(|(_, w)| w.busy.is_none())
            .collect();
        idle.sort_by(|a, b| b.1.last_active.cmp(&a.1.last_active).then(a.0.cmp(b.0)));
        idle.into_iter().map(|(id, _)| *id).collect()
    }

    /// Any connected worker, most recently active first.
    fn freshest_worker(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .max_by(|a, b| a.1.last_active.cmp(&b.1.last_active).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id)
    }
}

/// Worker entry for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub busy: bool,
    #[serde(rename = "correlationKey", skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    #[serde(rename = "connectedAt")]
    pub connected_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub workers: Vec<WorkerStatus>,
    #[serde(rename = "activeCorrelations")]
    pub active_correlations: usize,
    #[serde(rename = "oldestCorrelationSecs", skip_serializing_if = "Option::is_none")]
    pub oldest_correlation_secs: Option<u64>,
    #[serde(rename = "captureActive")]
    pub capture_active: bool,
}

/// Central registry of browser workers and in-flight correlations.
pub struct RelayRegistry {
    inner: Mutex<RegistryInner>,
    next_worker: AtomicU64,
    /// Woken whenever a worker may have become available.
    availability: Notify,
    options: RwLock<RelayOptions>,
    capture: Arc<CaptureCoordinator>,
    update: UpdateCoordinator,
}

impl RelayRegistry {
    pub fn new(pool: Arc<SessionPool>, options: RelayOptions) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_worker: AtomicU64::new(1),
            availability: Notify::new(),
            options: RwLock::new(options),
            capture: Arc::new(CaptureCoordinator::new(pool)),
            update: UpdateCoordinator::new(),
        }
    }

    pub fn options(&self) -> RelayOptions {
        self.options.read().clone()
    }

    pub fn set_options(&self, options: RelayOptions) {
        *self.options.write() = options;
    }

    // ---------------------------------------------------------------
    // Worker lifecycle
    // ---------------------------------------------------------------

    /// Register a freshly connected worker.
    pub fn register(&self, tx: WorkerSender) -> WorkerId {
        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut inner = self.inner.lock();
            inner.workers.insert(
                id,
                WorkerEntry {
                    tx,
                    busy: None,
                    connected_at: chrono::Utc::now(),
                    last_active: Instant::now(),
                    client: None,
                },
            );
            inner.workers.len()
        };
        info!("Browser worker {} registered ({} connected)", id, count);
        self.availability.notify_waiters();
        id
    }

    /// Forget a worker and fail every correlation bound to it. Idempotent.
    pub fn unregister(&self, id: WorkerId) -> bool {
        let (lost, remaining) = {
            let mut inner = self.inner.lock();
            if inner.workers.remove(&id).is_none() {
                return false;
            }
            let keys: Vec<CorrelationKey> = inner
                .slots
                .iter()
                .filter(|(_, s)| s.worker == id)
                .map(|(k, _)| k.clone())
                .collect();
            let lost: Vec<SlotEntry> = keys.iter().filter_map(|k| inner.slots.remove(k)).collect();
            (lost, inner.workers.len())
        };

        for slot in &lost {
            let _ = slot.sink.send(Err(Error::WorkerLost));
        }
        if lost.is_empty() {
            info!("Browser worker {} unregistered ({} remaining)", id, remaining);
        } else {
            warn!(
                "Browser worker {} lost with {} request(s) in flight ({} remaining)",
                id,
                lost.len(),
                remaining
            );
        }
        self.availability.notify_waiters();
        true
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn correlation_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_busy(&self, id: WorkerId) -> bool {
        self.inner
            .lock()
            .workers
            .get(&id)
            .is_some_and(|w| w.busy.is_some())
    }

    // ---------------------------------------------------------------
    // Dispatch / deliver / cancel
    // ---------------------------------------------------------------

    /// Send a chat command to a worker and open its correlation slot.
    pub async fn dispatch(
        self: &Arc<Self>,
        target: DispatchTarget,
        command: ChatCommand,
    ) -> Result<Correlation> {
        let key = CorrelationKey::new();
        let envelope = Envelope::command(Some(key.as_str()), &Command::Chat(command))?;
        let options = self.options();
        let deadline = tokio::time::Instant::now() + options.busy_wait;

        loop {
            // Registered before checking so a release between the check and
            // the await is not missed.
            let notified = self.availability.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(target, &key, &envelope) {
                Ok((worker, rx)) => {
                    info!("Dispatched {} to {}", key, worker);
                    return Ok(Correlation {
                        key,
                        worker,
                        rx,
                        registry: Arc::clone(self),
                        first_event_timeout: options.first_event_timeout,
                        idle_timeout: options.idle_timeout,
                        received_any: false,
                        done: false,
                    });
                }
                Err(Error::WorkerBusy) if options.busy_policy == BusyPolicy::Wait => {
                    debug!("All workers busy, {} waiting", key);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!("Gave up waiting for an idle worker for {}", key);
                        return Err(Error::WorkerBusy);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_claim(
        &self,
        target: DispatchTarget,
        key: &CorrelationKey,
        envelope: &Envelope,
    ) -> Result<(WorkerId, mpsc::UnboundedReceiver<SlotMessage>)> {
        let mut inner = self.inner.lock();
        if inner.workers.is_empty() {
            return Err(Error::NoWorkerAvailable);
        }

        let candidates = match target {
            DispatchTarget::AnyAvailable => inner.idle_workers(),
            DispatchTarget::Worker(id) => match inner.workers.get(&id) {
                None => return Err(Error::NoWorkerAvailable),
                Some(w) if w.busy.is_some() => Vec::new(),
                Some(_) => vec![id],
            },
        };

        for id in candidates {
            let Some(worker) = inner.workers.get_mut(&id) else {
                continue;
            };
            if worker.tx.send(envelope.clone()).is_err() {
                // Transport loop already gone; its unregister is on the way.
                warn!("{} has a closed channel, skipping", id);
                inner.workers.remove(&id);
                continue;
            }
            worker.busy = Some(key.clone());
            worker.last_active = Instant::now();

            let (sink, rx) = mpsc::unbounded_channel();
            inner.slots.insert(
                key.clone(),
                SlotEntry {
                    worker: id,
                    created_at: Instant::now(),
                    sink,
                },
            );
            return Ok((id, rx));
        }

        if inner.workers.is_empty() {
            Err(Error::NoWorkerAvailable)
        } else {
            Err(Error::WorkerBusy)
        }
    }

    /// Route a relay event to its slot. Unknown or finished keys are dropped.
    pub fn deliver(&self, key: &CorrelationKey, event: RelayEvent) -> bool {
        let terminal = event.is_terminal();
        {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.slots.get(key) else {
                drop(inner);
                warn!("Dropping late {} for unknown correlation {}", event_name(&event), key);
                return false;
            };
            let worker = slot.worker;
            if slot.sink.send(Ok(event)).is_err() {
                debug!("Receiver for {} already gone", key);
            }
            if let Some(w) = inner.workers.get_mut(&worker) {
                w.last_active = Instant::now();
            }
            if !terminal {
                return true;
            }
            inner.release(key);
        }
        debug!("Correlation {} finished", key);
        self.availability.notify_waiters();
        true
    }

    /// Abandon a correlation: free the worker and tell it to stop (best effort).
    pub fn cancel(&self, key: &CorrelationKey) -> bool {
        let tx = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.release(key) else {
                return false;
            };
            inner.workers.get(&slot.worker).map(|w| w.tx.clone())
        };

        if let Some(tx) = tx {
            match Envelope::command(Some(key.as_str()), &Command::Cancel) {
                Ok(env) => {
                    let _ = tx.send(env);
                }
                Err(e) => warn!("Failed to build cancel for {}: {}", key, e),
            }
        }
        info!("Correlation {} cancelled", key);
        self.availability.notify_waiters();
        true
    }

    // ---------------------------------------------------------------
    // Incoming frames
    // ---------------------------------------------------------------

    /// Route one parsed frame from `worker` by its tag. An `Err` is a protocol
    /// violation and the caller should drop the connection.
    pub fn handle_incoming(&self, worker: WorkerId, envelope: Envelope) -> Result<()> {
        match WorkerMessage::try_from(envelope)? {
            WorkerMessage::Register { client, version } => {
                let label = match (&client, &version) {
                    (Some(c), Some(v)) => format!("{} {}", c, v),
                    (Some(c), None) => c.clone(),
                    _ => "unknown client".to_string(),
                };
                info!("{} identified as {}", worker, label);
                if let Some(w) = self.inner.lock().workers.get_mut(&worker) {
                    w.client = Some(label);
                }
                Ok(())
            }
            WorkerMessage::Event { key, event } => {
                let owner = self.inner.lock().slots.get(&key).map(|s| s.worker);
                match owner {
                    Some(owner) if owner != worker => {
                        warn!("{} sent an event for {} owned by {}, ignored", worker, key, owner);
                    }
                    _ => {
                        self.deliver(&key, event);
                    }
                }
                Ok(())
            }
            WorkerMessage::CaptureEvent(ids) => {
                self.capture.on_capture_event(ids);
                Ok(())
            }
            WorkerMessage::PageContent { key, content } => {
                self.update.on_page_content(key.as_deref(), content);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------
    // Broadcast commands and coordinators
    // ---------------------------------------------------------------

    /// Send a non-correlated command to every connected worker.
    pub fn broadcast(&self, command: &Command) -> Result<usize> {
        let envelope = Envelope::command(None, command)?;
        let inner = self.inner.lock();
        let sent = inner
            .workers
            .values()
            .filter(|w| w.tx.send(envelope.clone()).is_ok())
            .count();
        Ok(sent)
    }

    /// Put the registry into capturing mode and ask workers to arm capture.
    pub fn activate_capture(&self, request: CaptureRequest, timeout: Duration) -> Result<CaptureTicket> {
        if self.worker_count() == 0 {
            return Err(Error::NoWorkerAvailable);
        }
        let command = Command::ActivateCapture {
            mode: request.mode,
            battle_target: request.battle_target,
        };
        let ticket = CaptureCoordinator::activate(&self.capture, request, timeout)?;
        if let Err(e) = self.broadcast(&command) {
            self.capture.deactivate();
            return Err(e);
        }
        Ok(ticket)
    }

    pub fn deactivate_capture(&self) -> bool {
        self.capture.deactivate()
    }

    pub fn capture_active(&self) -> bool {
        self.capture.is_active()
    }

    /// Ask one worker for its current page content and wait for the reply.
    pub async fn request_page_content(&self, timeout: Duration) -> Result<String> {
        let key = CorrelationKey::new();
        let rx = self.update.begin(key.as_str())?;

        let sent = {
            let inner = self.inner.lock();
            inner.freshest_worker().and_then(|id| {
                let env = Envelope::command(Some(key.as_str()), &Command::SendPageContent).ok()?;
                inner.workers.get(&id)?.tx.send(env).ok().map(|_| id)
            })
        };
        let Some(worker) = sent else {
            self.update.abandon(key.as_str());
            return Err(Error::NoWorkerAvailable);
        };
        info!("Requested page content from {}", worker);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(_)) => Err(Error::Internal("page content request dropped".into())),
            Err(_) => {
                self.update.abandon(key.as_str());
                Err(Error::Timeout(TimeoutPhase::FirstEvent))
            }
        }
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    pub fn status(&self) -> RegistryStatus {
        let inner = self.inner.lock();
        let mut workers: Vec<WorkerStatus> = inner
            .workers
            .iter()
            .map(|(id, w)| WorkerStatus {
                id: *id,
                busy: w.busy.is_some(),
                correlation_key: w.busy.as_ref().map(|k| k.to_string()),
                connected_at: w.connected_at.to_rfc3339(),
                client: w.client.clone(),
            })
            .collect();
        workers.sort_by_key(|w| w.id);

        RegistryStatus {
            workers,
            active_correlations: inner.slots.len(),
            oldest_correlation_secs: inner
                .slots
                .values()
                .map(|s| s.created_at.elapsed().as_secs())
                .max(),
            capture_active: self.capture.is_active(),
        }
    }
}

fn event_name(event: &RelayEvent) -> &'static str {
    match event {
        RelayEvent::TextDelta(_) => "text-delta",
        RelayEvent::ImageUrlDelta(_) => "image-url-delta",
        RelayEvent::AttachmentEcho(_) => "attachment-echo",
        RelayEvent::Error(_) => "error",
        RelayEvent::Finish { .. } => "finish",
    }
}

// ---------------------------------------------------------------
// Correlation handle
// ---------------------------------------------------------------

/// One outstanding request. Yields its worker's events in emission order;
/// dropping it before a terminal event cancels the request.
pub struct Correlation {
    key: CorrelationKey,
    worker: WorkerId,
    rx: mpsc::UnboundedReceiver<SlotMessage>,
    registry: Arc<RelayRegistry>,
    first_event_timeout: Duration,
    idle_timeout: Duration,
    received_any: bool,
    done: bool,
}

impl Correlation {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Next event, or `None` once a terminal event or failure was returned.
    pub async fn next_event(&mut self) -> Option<Result<RelayEvent>> {
        if self.done {
            return None;
        }
        let (limit, phase) = if self.received_any {
            (self.idle_timeout, TimeoutPhase::Idle)
        } else {
            (self.first_event_timeout, TimeoutPhase::FirstEvent)
        };

        let item = match tokio::time::timeout(limit, self.rx.recv()).await {
            Ok(Some(Ok(event))) => {
                self.received_any = true;
                if event.is_terminal() {
                    self.done = true;
                }
                Ok(event)
            }
            Ok(Some(Err(e))) => {
                self.done = true;
                Err(e)
            }
            Ok(None) => {
                // Slot removed without a terminal event: cancelled elsewhere.
                self.done = true;
                Err(Error::Cancelled)
            }
            Err(_) => {
                warn!("Correlation {} timed out ({})", self.key, phase);
                self.registry.cancel(&self.key);
                self.done = true;
                Err(Error::Timeout(phase))
            }
        };
        Some(item)
    }

    /// Stop waiting and release the worker.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.registry.cancel(&self.key);
        }
    }
}

impl Drop for Correlation {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arenabridge_pool::{Mode, ModelKind};

    fn registry(policy: BusyPolicy) -> (Arc<RelayRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(SessionPool::load(&dir.path().join("id_pool.json"), true).unwrap());
        let options = RelayOptions {
            busy_policy: policy,
            busy_wait: Duration::from_millis(300),
            first_event_timeout: Duration::from_millis(300),
            idle_timeout: Duration::from_millis(200),
        };
        (Arc::new(RelayRegistry::new(pool, options)), dir)
    }

    fn command() -> ChatCommand {
        ChatCommand {
            turns: vec![],
            session_id: "s".into(),
            message_id: "m".into(),
            target_model_id: None,
            mode: Mode::DirectChat,
            kind: ModelKind::Text,
        }
    }

    fn worker(reg: &RelayRegistry) -> (WorkerId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (reg.register(tx), rx)
    }

    #[tokio::test]
    async fn test_no_worker_creates_no_slot() {
        let (reg, _dir) = registry(BusyPolicy::Wait);
        let before = reg.correlation_count();
        let err = reg
            .dispatch(DispatchTarget::AnyAvailable, command())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoWorkerAvailable));
        assert_eq!(reg.correlation_count(), before);
    }

    #[tokio::test]
    async fn test_dispatch_sends_command_and_marks_busy() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, mut rx) = worker(&reg);

        let corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        assert_eq!(corr.worker(), id);
        assert!(reg.is_busy(id));
        assert_eq!(reg.correlation_count(), 1);

        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, MessageKind::Command);
        assert_eq!(env.correlation_key.as_deref(), Some(corr.key().as_str()));
        assert_eq!(env.payload["action"], "chat");
    }

    #[tokio::test]
    async fn test_finish_releases_worker_immediately() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, _rx) = worker(&reg);
        let mut corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let key = corr.key().clone();

        assert!(reg.deliver(&key, RelayEvent::TextDelta("Hello".into())));
        assert!(reg.deliver(&key, RelayEvent::Finish { reason: None }));
        assert!(!reg.is_busy(id));
        assert_eq!(reg.correlation_count(), 0);

        assert_eq!(
            corr.next_event().await.unwrap().unwrap(),
            RelayEvent::TextDelta("Hello".into())
        );
        assert!(corr.next_event().await.unwrap().unwrap().is_terminal());
        assert!(corr.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_second_dispatch_fails_fast_when_busy() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (_id, _rx) = worker(&reg);
        let _first = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let err = reg
            .dispatch(DispatchTarget::AnyAvailable, command())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::WorkerBusy));
        assert_eq!(reg.correlation_count(), 1);
    }

    #[tokio::test]
    async fn test_second_dispatch_waits_for_release() {
        let (reg, _dir) = registry(BusyPolicy::Wait);
        let (_id, _rx) = worker(&reg);
        let first = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let key = first.key().clone();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.dispatch(DispatchTarget::AnyAvailable, command()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        reg.deliver(&key, RelayEvent::Finish { reason: None });
        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second.key(), &key);
        drop(first);
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_budget() {
        let (reg, _dir) = registry(BusyPolicy::Wait);
        let (_id, _rx) = worker(&reg);
        let _first = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let err = reg
            .dispatch(DispatchTarget::AnyAvailable, command())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::WorkerBusy));
    }

    #[tokio::test]
    async fn test_waiter_sees_no_worker_after_disconnect() {
        let (reg, _dir) = registry(BusyPolicy::Wait);
        let (id, _rx) = worker(&reg);
        let _first = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.dispatch(DispatchTarget::AnyAvailable, command()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        reg.unregister(id);
        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, Error::NoWorkerAvailable));
    }

    #[tokio::test]
    async fn test_idle_worker_preferred_over_busy() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (a, _rxa) = worker(&reg);
        let (b, _rxb) = worker(&reg);
        let first = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let second = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let mut used = vec![first.worker(), second.worker()];
        used.sort();
        assert_eq!(used, vec![a, b]);
    }

    #[tokio::test]
    async fn test_unregister_fails_inflight_and_is_idempotent() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, _rx) = worker(&reg);
        let mut corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        reg.deliver(corr.key(), RelayEvent::TextDelta("partial".into()));

        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        assert_eq!(reg.correlation_count(), 0);

        assert!(corr.next_event().await.unwrap().is_ok());
        assert!(matches!(corr.next_event().await.unwrap(), Err(Error::WorkerLost)));
        assert!(corr.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_first_event_timeout_releases_worker() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, _rx) = worker(&reg);
        let mut corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let err = corr.next_event().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutPhase::FirstEvent)));
        assert!(!reg.is_busy(id));
        assert_eq!(reg.correlation_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_after_first_event() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, _rx) = worker(&reg);
        let mut corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        reg.deliver(corr.key(), RelayEvent::TextDelta("a".into()));
        assert!(corr.next_event().await.unwrap().is_ok());
        let err = corr.next_event().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutPhase::Idle)));
        assert!(!reg.is_busy(id));
    }

    #[tokio::test]
    async fn test_drop_cancels_and_notifies_worker() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, mut rx) = worker(&reg);
        let corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let key = corr.key().clone();
        let _chat = rx.recv().await.unwrap();

        drop(corr);
        assert!(!reg.is_busy(id));
        let cancel = rx.recv().await.unwrap();
        assert_eq!(cancel.payload["action"], "cancel");
        assert_eq!(cancel.correlation_key.as_deref(), Some(key.as_str()));

        // Late events after cancellation are dropped.
        assert!(!reg.deliver(&key, RelayEvent::TextDelta("late".into())));
    }

    #[tokio::test]
    async fn test_event_from_foreign_worker_is_ignored() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (_a, _rxa) = worker(&reg);
        let mut corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let (b, _rxb) = worker(&reg);

        let env = Envelope {
            kind: MessageKind::Finish,
            correlation_key: Some(corr.key().to_string()),
            payload: serde_json::Value::Null,
        };
        reg.handle_incoming(b, env).unwrap();
        assert_eq!(reg.correlation_count(), 1);
        corr.cancel();
        assert_eq!(reg.correlation_count(), 0);
    }

    #[tokio::test]
    async fn test_targeted_dispatch() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (_a, _rxa) = worker(&reg);
        let (b, _rxb) = worker(&reg);
        let corr = reg.dispatch(DispatchTarget::Worker(b), command()).await.unwrap();
        assert_eq!(corr.worker(), b);

        let err = reg
            .dispatch(DispatchTarget::Worker(WorkerId(999)), command())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoWorkerAvailable));
    }

    #[tokio::test]
    async fn test_closed_worker_channel_is_skipped() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (_a, rxa) = worker(&reg);
        drop(rxa);
        let err = reg
            .dispatch(DispatchTarget::AnyAvailable, command())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoWorkerAvailable));
        assert_eq!(reg.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_busy_worker() {
        let (reg, _dir) = registry(BusyPolicy::FailFast);
        let (id, _rx) = worker(&reg);
        let _corr = reg.dispatch(DispatchTarget::AnyAvailable, command()).await.unwrap();
        let status = reg.status();
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers[0].id, id);
        assert!(status.workers[0].busy);
        assert_eq!(status.active_correlations, 1);
        assert!(!status.capture_active);
    }
}
