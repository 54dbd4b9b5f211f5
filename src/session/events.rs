//! Status events published by running sessions

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Role;

/// Something that happened in a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connecting {
        address: String,
    },
    Connected {
        peer: SocketAddr,
    },
    Binding {
        address: SocketAddr,
    },
    AddressInUse {
        address: SocketAddr,
        attempt: u32,
        delay_ms: u64,
    },
    Listening {
        local: SocketAddr,
    },
    Waiting,
    PeerConnected {
        peer: SocketAddr,
    },
    /// A peer connected while another one was streaming and was turned away
    PeerRejected {
        peer: SocketAddr,
    },
    Streaming {
        sample_rate: u32,
        chunk_frames: u32,
        bytes_per_second: u64,
    },
    PeerDisconnected {
        peer: SocketAddr,
        reason: String,
        error: bool,
    },
    Warning {
        message: String,
    },
    Stopped,
    Failed {
        message: String,
    },
}

impl SessionEvent {
    /// The last event a session ever publishes
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Stopped | SessionEvent::Failed { .. })
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connecting { address } => write!(f, "Attempting to connect to {}", address),
            SessionEvent::Connected { peer } => write!(f, "Connected to {}", peer),
            SessionEvent::Binding { address } => write!(f, "Binding {}", address),
            SessionEvent::AddressInUse {
                address,
                attempt,
                delay_ms,
            } => write!(
                f,
                "Address {} already in use (attempt {}). Retrying in {:.1} seconds...",
                address,
                attempt,
                *delay_ms as f64 / 1000.0
            ),
            SessionEvent::Listening { local } => write!(f, "Listening on {}", local),
            SessionEvent::Waiting => f.write_str("Waiting for sender connection..."),
            SessionEvent::PeerConnected { peer } => write!(f, "Connection from {}", peer),
            SessionEvent::PeerRejected { peer } => {
                write!(f, "Rejected {}: another sender is already streaming", peer)
            }
            SessionEvent::Streaming {
                sample_rate,
                chunk_frames,
                bytes_per_second,
            } => write!(
                f,
                "Streaming at {} Hz, {} frames per chunk ({:.1} KB/s)",
                sample_rate,
                chunk_frames,
                *bytes_per_second as f64 / 1024.0
            ),
            SessionEvent::PeerDisconnected { peer, reason, .. } => {
                write!(f, "Connection from {} ended: {}", peer, reason)
            }
            SessionEvent::Warning { message } => f.write_str(message),
            SessionEvent::Stopped => f.write_str("Streaming stopped"),
            SessionEvent::Failed { message } => f.write_str(message),
        }
    }
}

/// A [`SessionEvent`] stamped with its origin
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub session: Uuid,
    pub role: Role,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.role, self.event)
    }
}

/// Publishes a session's events to the controller's channel and the log
#[derive(Clone)]
pub struct EventSink {
    session: Uuid,
    role: Role,
    tx: Sender<StatusEvent>,
}

impl EventSink {
    pub fn new(session: Uuid, role: Role, tx: Sender<StatusEvent>) -> Self {
        Self { session, role, tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Failed { .. } => tracing::error!("{}", event),
            SessionEvent::AddressInUse { .. }
            | SessionEvent::PeerRejected { .. }
            | SessionEvent::Warning { .. }
            | SessionEvent::PeerDisconnected { error: true, .. } => tracing::warn!("{}", event),
            _ => tracing::info!("{}", event),
        }

        // Nobody listening is fine
        let _ = self.tx.send(StatusEvent {
            session: self.session,
            role: self.role,
            at: Utc::now(),
            event,
        });
    }
}
