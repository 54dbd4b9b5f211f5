//! Sender loop: capture device -> TCP connection

use std::io::Write;

use crate::audio::CaptureStream;
use crate::error::{AudioError, Error, TransportError};
use crate::network::{connect_sender_with, Connection};
use crate::session::{SessionContext, SessionEvent, SessionOutcome, SessionState};

pub(crate) fn run(ctx: &SessionContext) -> SessionOutcome {
    let config = &ctx.config;
    ctx.shared.set_state(SessionState::Connecting);
    ctx.events.emit(SessionEvent::Connecting {
        address: config.address.clone(),
    });

    let shared = &ctx.shared;
    let connected = connect_sender_with(&config.address, config.connect_timeout, |closer| {
        shared.track_pending(closer)
    });
    let mut connection = match connected {
        Ok(connection) => connection,
        Err(e) => {
            shared.untrack_connection();
            return conclude(ctx, e.into());
        }
    };
    if !ctx.shared.track_connection(&connection) {
        ctx.close_connection(&mut connection);
        return SessionOutcome::Stopped;
    }
    ctx.shared.stats().record_connection();
    ctx.events.emit(SessionEvent::Connected {
        peer: connection.peer_addr(),
    });

    let params = config.stream_params();
    let mut capture = match ctx.backend.open_capture(&config.device, &params) {
        Ok(capture) => capture,
        Err(e) => {
            ctx.close_connection(&mut connection);
            return conclude(ctx, e.into());
        }
    };

    ctx.shared.set_state(SessionState::Streaming);
    ctx.events.emit(SessionEvent::Streaming {
        sample_rate: params.sample_rate,
        chunk_frames: params.chunk_frames,
        bytes_per_second: params.bytes_per_second(),
    });

    let mut buf = vec![0u8; params.chunk_bytes()];
    let result = forward(ctx, capture.as_mut(), &mut connection, &mut buf);

    ctx.close_connection(&mut connection);
    ctx.close_device(capture.as_mut());

    match result {
        Ok(()) => SessionOutcome::Stopped,
        Err(e) => conclude(ctx, e),
    }
}

/// Move chunks from the capture device to the socket until cancelled or an
/// error occurs.
fn forward(
    ctx: &SessionContext,
    capture: &mut dyn CaptureStream,
    connection: &mut Connection,
    buf: &mut [u8],
) -> Result<(), Error> {
    let cancel = ctx.cancel();
    while !cancel.is_cancelled() {
        capture.read_chunk(buf, cancel)?;
        connection.write_all(buf).map_err(TransportError::Io)?;
        ctx.shared.stats().record_chunk(buf.len());
    }
    Ok(())
}

/// Map the error that ended the loop onto the session outcome.
fn conclude(ctx: &SessionContext, error: Error) -> SessionOutcome {
    if ctx.shared.is_cancelled() || error.is_cancelled() {
        tracing::debug!("Sender interrupted by stop: {}", error);
        return SessionOutcome::Stopped;
    }
    if matches!(error, Error::Audio(AudioError::EndOfStream)) {
        tracing::info!("Capture source ended");
        return SessionOutcome::Stopped;
    }
    SessionOutcome::Failed {
        reason: format!("Sender error: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBackend, DrainBehavior, MemoryBackend};
    use crate::config::StreamConfig;
    use crate::session::{EventSink, SessionShared};
    use crossbeam_channel::{unbounded, Receiver};
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use uuid::Uuid;

    fn context(
        address: String,
        backend: Arc<dyn AudioBackend>,
    ) -> (SessionContext, Receiver<crate::session::StatusEvent>) {
        let (tx, rx) = unbounded();
        let config = StreamConfig::sender(address)
            .with_chunk_frames(4)
            .with_connect_timeout(Duration::from_secs(2));
        let ctx = SessionContext {
            events: EventSink::new(Uuid::new_v4(), config.role, tx),
            config,
            backend,
            shared: Arc::new(SessionShared::new()),
        };
        (ctx, rx)
    }

    #[test]
    fn test_forwards_chunks_in_order() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let chunks: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 16]).collect();
        let backend = Arc::new(MemoryBackend::new().with_capture_chunks(chunks.clone()));
        let log = backend.log();

        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let (ctx, rx) = context(addr.to_string(), backend);
        assert_eq!(run(&ctx), SessionOutcome::Stopped);

        assert_eq!(reader.join().unwrap(), chunks.concat());
        assert_eq!(log.open_streams(), 0);
        assert_eq!(ctx.shared.stats().snapshot().chunks, 5);

        let events: Vec<_> = rx.try_iter().map(|e| e.event).collect();
        assert!(matches!(events[0], SessionEvent::Connecting { .. }));
        assert!(matches!(events[1], SessionEvent::Connected { .. }));
        assert!(matches!(events[2], SessionEvent::Streaming { .. }));
    }

    #[test]
    fn test_connect_failure_opens_nothing() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let backend = Arc::new(MemoryBackend::new());
        let log = backend.log();

        let (ctx, _rx) = context(format!("127.0.0.1:{}", port), backend);
        match run(&ctx) {
            SessionOutcome::Failed { reason } => assert!(reason.starts_with("Sender error")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(log.captures_opened(), 0);
    }

    #[test]
    fn test_device_failure_closes_connection() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let backend = Arc::new(MemoryBackend::new().failing_capture_open());

        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).map(|_| received.len())
        });

        let (ctx, _rx) = context(addr.to_string(), backend);
        assert!(matches!(run(&ctx), SessionOutcome::Failed { .. }));
        // The peer sees the connection end with no audio
        assert!(matches!(reader.join().unwrap(), Ok(0) | Err(_)));
    }

    #[test]
    fn test_cancel_while_capture_blocks() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let backend = Arc::new(MemoryBackend::new().when_drained(DrainBehavior::Block));
        let log = backend.log();

        let (ctx, _rx) = context(addr.to_string(), backend);
        let shared = ctx.shared.clone();
        let stopper = thread::spawn(move || {
            let _peer = server.accept().unwrap();
            thread::sleep(Duration::from_millis(50));
            shared.shutdown();
        });

        assert_eq!(run(&ctx), SessionOutcome::Stopped);
        stopper.join().unwrap();
        assert_eq!(log.captures_closed(), 1);
    }

    #[test]
    fn test_peer_drop_mid_stream_fails() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let backend = Arc::new(MemoryBackend::new().when_drained(DrainBehavior::Silence));
        let log = backend.log();

        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut chunk = [0u8; 16];
            stream.read_exact(&mut chunk).unwrap();
        });

        let (ctx, _rx) = context(addr.to_string(), backend);
        match run(&ctx) {
            SessionOutcome::Failed { reason } => assert!(reason.starts_with("Sender error")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        reader.join().unwrap();

        assert!(ctx.shared.stats().snapshot().chunks >= 1);
        assert_eq!(log.captures_closed(), 1);
        assert_eq!(log.open_streams(), 0);
    }
}
