//! Streaming sessions
//!
//! A session runs one role on a dedicated worker thread. The worker owns the
//! socket and the audio stream; the controller only holds [`SessionShared`],
//! through which it can cancel the session and shut down whatever socket the
//! worker is currently blocked on.

pub mod cancel;
pub mod controller;
pub mod events;
mod receiver;
mod sender;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::audio::{AudioBackend, DeviceStream};
use crate::config::{Role, StreamConfig};
use crate::network::{Connection, ConnectionCloser, Listener, ListenerCloser};

pub use cancel::CancelToken;
pub use controller::{ControllerStatus, SessionController};
pub use events::{EventSink, SessionEvent, StatusEvent};

/// Where a session currently is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Binding,
    Waiting,
    Streaming,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Binding => "binding",
            SessionState::Waiting => "waiting",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Stopped,
    Failed { reason: String },
}

/// Running totals for one session
#[derive(Debug, Default)]
pub struct SessionStats {
    chunks: AtomicU64,
    bytes: AtomicU64,
    connections: AtomicU64,
}

impl SessionStats {
    pub(crate) fn record_chunk(&self, bytes: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Chunks forwarded to the socket (sender) or the device (receiver)
    pub chunks: u64,
    pub bytes: u64,
    /// Peers served
    pub connections: u64,
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub role: Role,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: SessionOutcome,
    pub stats: StatsSnapshot,
}

/// State shared between a session's worker and the controller
#[derive(Default)]
pub struct SessionShared {
    cancel: CancelToken,
    connection: Mutex<Option<ConnectionCloser>>,
    listener: Mutex<Option<ListenerCloser>>,
    state: Mutex<Option<SessionState>>,
    stats: SessionStats,
}

impl SessionShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap_or(SessionState::Idle)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = Some(state);
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Cancel the session and shut down the socket the worker may be blocked on.
    pub fn shutdown(&self) {
        if !self.cancel.cancel() {
            return;
        }
        if let Some(closer) = self.connection.lock().as_ref() {
            if let Err(e) = closer.close() {
                tracing::debug!("Error closing socket: {}", e);
            }
        }
        if let Some(closer) = self.listener.lock().as_ref() {
            closer.close();
        }
    }

    /// Register the worker's live connection. Returns `false` if the session
    /// was cancelled first, in which case the caller must close it.
    pub(crate) fn track_connection(&self, connection: &Connection) -> bool {
        let closer = match connection.closer() {
            Ok(closer) => Some(closer),
            Err(e) => {
                tracing::warn!("Connection cannot be closed from another thread: {}", e);
                None
            }
        };
        self.track_closer(closer)
    }

    /// Register a socket that is still connecting so Stop can abort it.
    pub(crate) fn track_pending(&self, closer: ConnectionCloser) -> bool {
        self.track_closer(Some(closer))
    }

    fn track_closer(&self, closer: Option<ConnectionCloser>) -> bool {
        let mut slot = self.connection.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *slot = closer;
        true
    }

    pub(crate) fn untrack_connection(&self) {
        self.connection.lock().take();
    }

    pub(crate) fn track_listener(&self, listener: &Listener) -> bool {
        let closer = match listener.closer() {
            Ok(closer) => Some(closer),
            Err(e) => {
                tracing::warn!("Listener cannot be closed from another thread: {}", e);
                None
            }
        };
        let mut slot = self.listener.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *slot = closer;
        true
    }

    pub(crate) fn untrack_listener(&self) {
        self.listener.lock().take();
    }
}

/// Everything a worker needs to run one session
pub(crate) struct SessionContext {
    pub config: StreamConfig,
    pub backend: Arc<dyn AudioBackend>,
    pub shared: Arc<SessionShared>,
    pub events: EventSink,
}

impl SessionContext {
    pub fn cancel(&self) -> &CancelToken {
        &self.shared.cancel
    }

    /// Shut the connection down and forget its closer. A failure is reported,
    /// never propagated.
    pub fn close_connection(&self, connection: &mut Connection) {
        self.shared.untrack_connection();
        if let Err(e) = connection.close() {
            self.events.emit(SessionEvent::Warning {
                message: format!("Error closing socket: {}", e),
            });
        }
    }

    /// Stop and release an audio stream. A failure is reported, never propagated.
    pub fn close_device<D: DeviceStream + ?Sized>(&self, device: &mut D) {
        if let Err(e) = device.close() {
            self.events.emit(SessionEvent::Warning {
                message: format!("Error closing stream: {}", e),
            });
        }
    }
}

/// Worker entry point: run the configured role and publish the terminal event.
pub(crate) fn run(ctx: SessionContext) -> SessionOutcome {
    let outcome = match ctx.config.role {
        Role::Sender => sender::run(&ctx),
        Role::Receiver => receiver::run(&ctx),
    };

    match &outcome {
        SessionOutcome::Stopped => {
            ctx.shared.set_state(SessionState::Stopped);
            ctx.events.emit(SessionEvent::Stopped);
        }
        SessionOutcome::Failed { reason } => {
            ctx.shared.set_state(SessionState::Failed);
            ctx.events.emit(SessionEvent::Failed {
                message: reason.clone(),
            });
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_shutdown_closes_tracked_connection() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut client =
            crate::network::connect_sender(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let (_peer, _) = server.accept().unwrap();

        let shared = SessionShared::new();
        assert!(shared.track_connection(&client));
        shared.shutdown();
        assert!(shared.is_cancelled());

        // The socket is shut down for writing now
        let mut failed = false;
        for _ in 0..64 {
            if client.write_all(&[0u8; 1024]).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);

        // Tracking after cancel is refused
        assert!(!shared.track_connection(&client));
    }

    #[test]
    fn test_state_and_stats() {
        let shared = SessionShared::new();
        assert_eq!(shared.state(), SessionState::Idle);
        shared.set_state(SessionState::Streaming);
        assert_eq!(shared.state(), SessionState::Streaming);

        shared.stats().record_connection();
        shared.stats().record_chunk(4096);
        shared.stats().record_chunk(4096);
        assert_eq!(
            shared.stats().snapshot(),
            StatsSnapshot {
                chunks: 2,
                bytes: 8192,
                connections: 1
            }
        );
    }
}
