//! Session lifecycle: at most one session per controller

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::audio::AudioBackend;
use crate::config::{Role, StreamConfig};
use crate::error::{Error, Result};
use crate::session::{
    self, EventSink, SessionContext, SessionOutcome, SessionReport, SessionShared, SessionState,
    StatsSnapshot, StatusEvent,
};

/// The live state of one run, owned by the controller
struct SessionHandle {
    id: Uuid,
    role: Role,
    started_at: DateTime<Utc>,
    started: Instant,
    shared: Arc<SessionShared>,
    worker: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and summarize the run.
    fn finish(self) -> SessionReport {
        let outcome = self.worker.join().unwrap_or_else(|_| {
            tracing::error!("Session {} worker panicked", self.id);
            SessionOutcome::Failed {
                reason: "Session worker panicked".to_string(),
            }
        });
        SessionReport {
            id: self.id,
            role: self.role,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            outcome,
            stats: self.shared.stats().snapshot(),
        }
    }
}

/// Snapshot of what the controller is doing
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub session: Option<Uuid>,
    pub role: Option<Role>,
    pub state: SessionState,
    pub stats: StatsSnapshot,
}

/// Starts and stops streaming sessions.
///
/// Commands go in through [`start`](Self::start) and [`stop`](Self::stop);
/// notifications come out of [`events`](Self::events). Events from every
/// session share one unbounded channel, so a caller that never drains it
/// should not keep a controller around for long runs.
pub struct SessionController {
    backend: Arc<dyn AudioBackend>,
    current: Mutex<Option<SessionHandle>>,
    last_report: Mutex<Option<SessionReport>>,
    events_tx: Sender<StatusEvent>,
    events_rx: Receiver<StatusEvent>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            backend,
            current: Mutex::new(None),
            last_report: Mutex::new(None),
            events_tx,
            events_rx,
        }
    }

    /// Receiver for the status events of every session this controller runs
    pub fn events(&self) -> Receiver<StatusEvent> {
        self.events_rx.clone()
    }

    /// Validate `config` and run it on a new worker thread.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a session is active. A
    /// session that already ended on its own is reaped first.
    pub fn start(&self, config: StreamConfig) -> Result<Uuid> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::AlreadyRunning);
        }
        if let Some(finished) = current.take() {
            *self.last_report.lock() = Some(finished.finish());
        }

        config.validate()?;

        let id = Uuid::new_v4();
        let role = config.role;
        let shared = Arc::new(SessionShared::new());
        let ctx = SessionContext {
            events: EventSink::new(id, role, self.events_tx.clone()),
            config,
            backend: self.backend.clone(),
            shared: shared.clone(),
        };

        let span = tracing::info_span!("session", id = %id, role = %role);
        let worker = thread::Builder::new()
            .name(format!("{}-session", role))
            .spawn(move || {
                let _entered = span.enter();
                session::run(ctx)
            })?;

        tracing::info!("Started {} session {}", role, id);
        *current = Some(SessionHandle {
            id,
            role,
            started_at: Utc::now(),
            started: Instant::now(),
            shared,
            worker,
        });
        Ok(id)
    }

    /// Cancel the active session and wait for its worker to exit.
    ///
    /// Returns the finished session's report, or `None` if nothing was
    /// running. Safe to call repeatedly.
    pub fn stop(&self) -> Option<SessionReport> {
        // Held until the worker is joined so no new session can start meanwhile
        let mut current = self.current.lock();
        let handle = current.take()?;

        tracing::info!("Stopping {} session {}", handle.role, handle.id);
        handle.shared.shutdown();
        let report = handle.finish();

        *self.last_report.lock() = Some(report.clone());
        Some(report)
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn status(&self) -> ControllerStatus {
        match self.current.lock().as_ref() {
            Some(handle) => ControllerStatus {
                session: Some(handle.id),
                role: Some(handle.role),
                state: handle.shared.state(),
                stats: handle.shared.stats().snapshot(),
            },
            None => ControllerStatus {
                session: None,
                role: None,
                state: SessionState::Idle,
                stats: StatsSnapshot::default(),
            },
        }
    }

    /// Report of the most recently finished session
    pub fn last_report(&self) -> Option<SessionReport> {
        self.last_report.lock().clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}
