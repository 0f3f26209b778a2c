//! ID capture — a one-shot window in which the next identifiers a worker
//! observes on the upstream site are written into the session pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arenabridge_core::{Error, Result};
use arenabridge_pool::{BattleTarget, CapturePolicy, CaptureTarget, IdTuple, Mode, SessionPool};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::protocol::CapturedIds;

/// What to do with the next captured tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub target: CaptureTarget,
    pub mode: Mode,
    pub battle_target: Option<BattleTarget>,
    pub policy: CapturePolicy,
}

struct ActiveCapture {
    id: u64,
    request: CaptureRequest,
    expires_at: Instant,
    reply: oneshot::Sender<Result<IdTuple>>,
}

pub struct CaptureCoordinator {
    pool: Arc<SessionPool>,
    active: Mutex<Option<ActiveCapture>>,
    next_id: AtomicU64,
}

impl CaptureCoordinator {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a capture window. Only one may be open at a time.
    pub fn activate(self: &Arc<Self>, request: CaptureRequest, timeout: Duration) -> Result<CaptureTicket> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if current.expires_at > Instant::now() {
                return Err(Error::CoordinatorBusy("ID capture"));
            }
            warn!("Discarding expired capture window #{}", current.id);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + timeout;
        let (reply, rx) = oneshot::channel();
        info!(
            "Capture window #{} opened for {} ({}, {:?})",
            id, request.target, request.mode, request.policy
        );
        *active = Some(ActiveCapture {
            id,
            request,
            expires_at,
            reply,
        });

        Ok(CaptureTicket {
            id,
            rx,
            expires_at,
            coordinator: Arc::clone(self),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| a.expires_at > Instant::now())
    }

    /// Close whatever window is open.
    pub fn deactivate(&self) -> bool {
        let taken = self.active.lock().take();
        match taken {
            Some(active) => {
                info!("Capture window #{} cancelled", active.id);
                let _ = active.reply.send(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    fn expire(&self, id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
            warn!("Capture window #{} expired without an event", id);
        }
    }

    /// Handle a worker's capture-event. Ignored unless a window is open.
    pub fn on_capture_event(&self, ids: CapturedIds) {
        let Some(active) = self.active.lock().take() else {
            warn!("Capture event received while not capturing, ignored");
            return;
        };
        if active.expires_at <= Instant::now() {
            warn!("Capture event arrived after window #{} expired", active.id);
            return;
        }

        let request = &active.request;
        let side = match request.mode {
            Mode::Battle => Some(request.battle_target.unwrap_or(BattleTarget::A)),
            Mode::DirectChat => None,
        };
        let tuple = IdTuple::new(ids.session_id, ids.message_id).with_mode(request.mode, side);

        let outcome = self
            .pool
            .capture(&request.target, tuple.clone(), request.policy)
            .map(|_| tuple);
        if let Err(e) = &outcome {
            error!("Failed to store captured identifiers: {}", e);
        }
        let _ = active.reply.send(outcome);
    }
}

/// Handle for a caller waiting on an open capture window.
pub struct CaptureTicket {
    id: u64,
    rx: oneshot::Receiver<Result<IdTuple>>,
    expires_at: Instant,
    coordinator: Arc<CaptureCoordinator>,
}

impl CaptureTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until a tuple is captured and stored, or the window expires.
    pub async fn wait(self) -> Result<IdTuple> {
        match tokio::time::timeout_at(self.expires_at, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.coordinator.expire(self.id);
                Err(Error::NotCaptured)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (Arc<CaptureCoordinator>, Arc<SessionPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(SessionPool::load(&dir.path().join("id_pool.json"), false).unwrap());
        (Arc::new(CaptureCoordinator::new(pool.clone())), pool, dir)
    }

    fn request(model: &str, mode: Mode) -> CaptureRequest {
        CaptureRequest {
            target: CaptureTarget::Model(model.into()),
            mode,
            battle_target: Some(BattleTarget::B),
            policy: CapturePolicy::Replace,
        }
    }

    #[tokio::test]
    async fn test_capture_writes_pool() {
        let (coord, pool, _dir) = coordinator();
        let ticket = coord
            .activate(request("opus", Mode::DirectChat), Duration::from_secs(5))
            .unwrap();
        assert!(coord.is_active());

        coord.on_capture_event(CapturedIds {
            session_id: "sess".into(),
            message_id: "msg".into(),
        });
        let tuple = ticket.wait().await.unwrap();
        assert_eq!(tuple.session_id, "sess");
        assert_eq!(tuple.battle_target, None);
        assert!(!coord.is_active());

        let resolved = pool.resolve("opus").unwrap();
        assert_eq!(resolved.tuple, tuple);
        assert_eq!(resolved.mode, Mode::DirectChat);
    }

    #[tokio::test]
    async fn test_battle_capture_keeps_side() {
        let (coord, pool, _dir) = coordinator();
        let ticket = coord
            .activate(request("opus", Mode::Battle), Duration::from_secs(5))
            .unwrap();
        coord.on_capture_event(CapturedIds {
            session_id: "s".into(),
            message_id: "m".into(),
        });
        ticket.wait().await.unwrap();
        let resolved = pool.resolve("opus").unwrap();
        assert_eq!(resolved.mode, Mode::Battle);
        assert_eq!(resolved.battle_target, BattleTarget::B);
    }

    #[tokio::test]
    async fn test_second_activation_is_busy() {
        let (coord, _pool, _dir) = coordinator();
        let _ticket = coord
            .activate(request("a", Mode::DirectChat), Duration::from_secs(5))
            .unwrap();
        let err = coord
            .activate(request("b", Mode::DirectChat), Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(matches!(err, Error::CoordinatorBusy(_)));
    }

    #[tokio::test]
    async fn test_timeout_returns_not_captured_and_frees_window() {
        let (coord, pool, _dir) = coordinator();
        let ticket = coord
            .activate(request("a", Mode::DirectChat), Duration::from_millis(50))
            .unwrap();
        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, Error::NotCaptured));
        assert!(!coord.is_active());

        // A late event changes nothing.
        coord.on_capture_event(CapturedIds {
            session_id: "late".into(),
            message_id: "late".into(),
        });
        assert!(pool.tuples("a").is_empty());

        assert!(coord
            .activate(request("a", Mode::DirectChat), Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test]
    async fn test_event_without_window_is_ignored() {
        let (coord, pool, _dir) = coordinator();
        coord.on_capture_event(CapturedIds {
            session_id: "s".into(),
            message_id: "m".into(),
        });
        assert!(pool.model_names().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_cancels_waiter() {
        let (coord, _pool, _dir) = coordinator();
        let ticket = coord
            .activate(request("a", Mode::DirectChat), Duration::from_secs(5))
            .unwrap();
        assert!(coord.deactivate());
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
        assert!(!coord.deactivate());
    }

    #[tokio::test]
    async fn test_blank_ids_are_rejected() {
        let (coord, pool, _dir) = coordinator();
        let ticket = coord
            .activate(request("a", Mode::DirectChat), Duration::from_secs(5))
            .unwrap();
        coord.on_capture_event(CapturedIds {
            session_id: " ".into(),
            message_id: "m".into(),
        });
        assert!(ticket.wait().await.is_err());
        assert!(pool.tuples("a").is_empty());
    }
}
