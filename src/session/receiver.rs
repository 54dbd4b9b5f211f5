//! Receiver loop: TCP listener -> playback device, one peer at a time

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::audio::PlaybackStream;
use crate::constants::ACCEPT_RETRY_DELAY;
use crate::error::{AudioError, Error};
use crate::network::{listen_receiver, Connection, Listener};
use crate::session::{SessionContext, SessionEvent, SessionOutcome, SessionState};

/// Why a peer's stream ended
enum PeerEnd {
    Closed,
    Cancelled,
    ReadFailed(io::Error),
    WriteFailed(AudioError),
}

impl PeerEnd {
    fn is_error(&self) -> bool {
        matches!(self, PeerEnd::ReadFailed(_) | PeerEnd::WriteFailed(_))
    }

    fn describe(&self) -> String {
        match self {
            PeerEnd::Closed => "peer closed the connection".to_string(),
            PeerEnd::Cancelled => "stopped".to_string(),
            PeerEnd::ReadFailed(e) => format!("socket read failed: {}", e),
            PeerEnd::WriteFailed(e) => format!("playback write failed: {}", e),
        }
    }
}

pub(crate) fn run(ctx: &SessionContext) -> SessionOutcome {
    let config = &ctx.config;
    let address = match config.bind_addr() {
        Ok(address) => address,
        Err(e) => return conclude(ctx, e.into()),
    };

    ctx.shared.set_state(SessionState::Binding);
    ctx.events.emit(SessionEvent::Binding { address });

    let bound = listen_receiver(address, &config.bind_backoff, ctx.cancel(), |attempt| {
        ctx.events.emit(SessionEvent::AddressInUse {
            address: attempt.address,
            attempt: attempt.retry_count,
            delay_ms: whole_millis(attempt.delay),
        })
    });
    let listener = match bound {
        Ok(listener) => listener,
        Err(e) => return conclude(ctx, e.into()),
    };
    if !ctx.shared.track_listener(&listener) {
        return SessionOutcome::Stopped;
    }
    ctx.events.emit(SessionEvent::Listening {
        local: listener.local_addr(),
    });

    let outcome = serve(ctx, &listener);
    ctx.shared.untrack_listener();
    outcome
}

/// Accept peers one after another until cancelled.
fn serve(ctx: &SessionContext, listener: &Listener) -> SessionOutcome {
    let cancel = ctx.cancel();
    loop {
        if cancel.is_cancelled() {
            return SessionOutcome::Stopped;
        }
        ctx.shared.set_state(SessionState::Waiting);
        ctx.events.emit(SessionEvent::Waiting);

        let mut connection = match listener.accept() {
            Ok(connection) => connection,
            Err(_) if cancel.is_cancelled() => return SessionOutcome::Stopped,
            Err(e) => {
                ctx.events.emit(SessionEvent::Warning {
                    message: e.to_string(),
                });
                if cancel.wait_timeout(ACCEPT_RETRY_DELAY) {
                    return SessionOutcome::Stopped;
                }
                continue;
            }
        };
        if cancel.is_cancelled() {
            ctx.close_connection(&mut connection);
            return SessionOutcome::Stopped;
        }

        if let Err(e) = stream_peer(ctx, &mut connection) {
            return conclude(ctx, e);
        }
        if cancel.is_cancelled() {
            return SessionOutcome::Stopped;
        }

        // Peers that queued up while we were busy are turned away
        match listener.reject_pending() {
            Ok(rejected) => {
                for peer in rejected {
                    ctx.events.emit(SessionEvent::PeerRejected { peer });
                }
            }
            Err(e) => ctx.events.emit(SessionEvent::Warning {
                message: format!("Failed to clear pending connections: {}", e),
            }),
        }
    }
}

/// Play one peer's stream. An error here ends the whole session; the peer
/// going away does not.
fn stream_peer(ctx: &SessionContext, connection: &mut Connection) -> Result<(), Error> {
    let peer = connection.peer_addr();
    ctx.events.emit(SessionEvent::PeerConnected { peer });
    ctx.shared.stats().record_connection();

    if !ctx.shared.track_connection(connection) {
        ctx.close_connection(connection);
        return Ok(());
    }

    let params = ctx.config.stream_params();
    let mut playback = match ctx.backend.open_playback(&ctx.config.device, &params) {
        Ok(playback) => playback,
        Err(e) => {
            ctx.close_connection(connection);
            return Err(e.into());
        }
    };

    ctx.shared.set_state(SessionState::Streaming);
    ctx.events.emit(SessionEvent::Streaming {
        sample_rate: params.sample_rate,
        chunk_frames: params.chunk_frames,
        bytes_per_second: params.bytes_per_second(),
    });

    let mut buf = vec![0u8; params.chunk_bytes()];
    let end = play(ctx, connection, playback.as_mut(), &mut buf, params.bytes_per_frame());

    ctx.close_connection(connection);
    ctx.close_device(playback.as_mut());

    disconnected(ctx, peer, &end);
    Ok(())
}

fn play(
    ctx: &SessionContext,
    connection: &mut Connection,
    playback: &mut dyn PlaybackStream,
    buf: &mut [u8],
    frame_bytes: usize,
) -> PeerEnd {
    let cancel = ctx.cancel();
    loop {
        if cancel.is_cancelled() {
            return PeerEnd::Cancelled;
        }

        let n = match connection.read_chunk(buf) {
            Ok(n) => n,
            Err(_) if cancel.is_cancelled() => return PeerEnd::Cancelled,
            Err(e) => return PeerEnd::ReadFailed(e),
        };

        // A torn frame at the end of the stream is never played
        let whole = n - n % frame_bytes;
        if whole < n {
            tracing::debug!("Dropping {} trailing bytes of a partial frame", n - whole);
        }
        if whole > 0 {
            match playback.write(&buf[..whole], cancel) {
                Ok(()) => ctx.shared.stats().record_chunk(whole),
                Err(_) if cancel.is_cancelled() => return PeerEnd::Cancelled,
                Err(AudioError::Cancelled) => return PeerEnd::Cancelled,
                Err(e) => return PeerEnd::WriteFailed(e),
            }
        }

        if n < buf.len() {
            return if cancel.is_cancelled() {
                PeerEnd::Cancelled
            } else {
                PeerEnd::Closed
            };
        }
    }
}

/// Milliseconds in `delay`, saturating for delays beyond `u64::MAX` ms
fn whole_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn disconnected(ctx: &SessionContext, peer: SocketAddr, end: &PeerEnd) {
    ctx.events.emit(SessionEvent::PeerDisconnected {
        peer,
        reason: end.describe(),
        error: end.is_error(),
    });
}

fn conclude(ctx: &SessionContext, error: Error) -> SessionOutcome {
    if ctx.shared.is_cancelled() || error.is_cancelled() {
        tracing::debug!("Receiver interrupted by stop: {}", error);
        return SessionOutcome::Stopped;
    }
    SessionOutcome::Failed {
        reason: format!("Receiver error: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBackend, MemoryBackend};
    use crate::config::{BackoffPolicy, StreamConfig};
    use crate::session::{EventSink, SessionShared, StatusEvent};
    use crossbeam_channel::{unbounded, Receiver};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    fn context(
        address: &str,
        backend: Arc<dyn AudioBackend>,
    ) -> (SessionContext, Receiver<StatusEvent>) {
        let (tx, rx) = unbounded();
        let config = StreamConfig::receiver(address)
            .with_chunk_frames(4)
            .with_bind_backoff(BackoffPolicy::new(Duration::from_millis(1), 3));
        let ctx = SessionContext {
            events: EventSink::new(Uuid::new_v4(), config.role, tx),
            config,
            backend,
            shared: Arc::new(SessionShared::new()),
        };
        (ctx, rx)
    }

    fn next_matching(
        rx: &Receiver<StatusEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap().event;
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_plays_frames_and_drops_torn_tail() {
        let backend = Arc::new(MemoryBackend::new());
        let log = backend.log();
        let (ctx, rx) = context("127.0.0.1:0", backend);
        let ctx = Arc::new(ctx);

        let worker = {
            let ctx = ctx.clone();
            thread::spawn(move || run(&ctx))
        };

        let local = match next_matching(&rx, |e| matches!(e, SessionEvent::Listening { .. })) {
            SessionEvent::Listening { local } => local,
            _ => unreachable!(),
        };
        let mut client = TcpStream::connect(local).unwrap();
        // One full 16-byte chunk, then 6 bytes: one frame and a torn half frame
        client.write_all(&[7u8; 22]).unwrap();
        drop(client);

        let end = next_matching(&rx, |e| matches!(e, SessionEvent::PeerDisconnected { .. }));
        assert!(matches!(end, SessionEvent::PeerDisconnected { error: false, .. }));
        next_matching(&rx, |e| *e == SessionEvent::Waiting);

        ctx.shared.shutdown();
        assert_eq!(worker.join().unwrap(), SessionOutcome::Stopped);

        let sizes: Vec<usize> = log.writes().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![16, 4]);
        assert_eq!(log.open_streams(), 0);
    }

    #[test]
    fn test_bind_exhaustion_fails() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        let (ctx, rx) = context(&addr.to_string(), Arc::new(MemoryBackend::new()));

        match run(&ctx) {
            SessionOutcome::Failed { reason } => assert!(reason.contains("3 attempts")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let retries = rx
            .try_iter()
            .filter(|e| matches!(e.event, SessionEvent::AddressInUse { .. }))
            .count();
        assert_eq!(retries, 3);
    }

    #[test]
    fn test_playback_open_failure_fails_session() {
        let backend = Arc::new(MemoryBackend::new().failing_playback_open());
        let (ctx, rx) = context("127.0.0.1:0", backend);
        let ctx = Arc::new(ctx);

        let worker = {
            let ctx = ctx.clone();
            thread::spawn(move || run(&ctx))
        };
        let local = match next_matching(&rx, |e| matches!(e, SessionEvent::Listening { .. })) {
            SessionEvent::Listening { local } => local,
            _ => unreachable!(),
        };
        let _client = TcpStream::connect(local).unwrap();

        assert!(matches!(worker.join().unwrap(), SessionOutcome::Failed { .. }));
    }

    #[test]
    fn test_write_failure_returns_to_waiting() {
        let backend = Arc::new(MemoryBackend::new().failing_writes_after(0));
        let log = backend.log();
        let (ctx, rx) = context("127.0.0.1:0", backend);
        let ctx = Arc::new(ctx);

        let worker = {
            let ctx = ctx.clone();
            thread::spawn(move || run(&ctx))
        };
        let local = match next_matching(&rx, |e| matches!(e, SessionEvent::Listening { .. })) {
            SessionEvent::Listening { local } => local,
            _ => unreachable!(),
        };
        next_matching(&rx, |e| *e == SessionEvent::Waiting);

        let mut client = TcpStream::connect(local).unwrap();
        client.write_all(&[1u8; 16]).unwrap();

        let end = next_matching(&rx, |e| matches!(e, SessionEvent::PeerDisconnected { .. }));
        assert!(matches!(end, SessionEvent::PeerDisconnected { error: true, .. }));
        next_matching(&rx, |e| *e == SessionEvent::Waiting);
        assert_eq!(ctx.shared.state(), SessionState::Waiting);

        ctx.shared.shutdown();
        assert_eq!(worker.join().unwrap(), SessionOutcome::Stopped);
        assert_eq!(log.playbacks_closed(), 1);
    }

    #[test]
    fn test_accept_error_warns_and_waits_again() {
        let (ctx, rx) = context("127.0.0.1:0", Arc::new(MemoryBackend::new()));
        let ctx = Arc::new(ctx);

        let worker = {
            let ctx = ctx.clone();
            thread::spawn(move || run(&ctx))
        };
        next_matching(&rx, |e| matches!(e, SessionEvent::Listening { .. }));
        next_matching(&rx, |e| *e == SessionEvent::Waiting);

        // Break the listening socket without stopping the session
        ctx.shared.listener.lock().as_ref().unwrap().close();

        match next_matching(&rx, |e| matches!(e, SessionEvent::Warning { .. })) {
            SessionEvent::Warning { message } => assert!(message.starts_with("Accept failed")),
            _ => unreachable!(),
        }
        next_matching(&rx, |e| *e == SessionEvent::Waiting);
        assert!(!ctx.shared.is_cancelled());

        ctx.shared.shutdown();
        assert_eq!(worker.join().unwrap(), SessionOutcome::Stopped);
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_millis(512)), 512);
        assert_eq!(whole_millis(Duration::from_micros(1500)), 1);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }
}
