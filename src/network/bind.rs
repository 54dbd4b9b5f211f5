//! Receiver-side bind with exponential backoff

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::BackoffPolicy;
use crate::constants::LISTEN_BACKLOG;
use crate::error::TransportError;
use crate::network::Listener;
use crate::session::CancelToken;

/// One failed bind in a retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub address: SocketAddr,
    /// Wait before the next attempt
    pub delay: Duration,
    /// Failed attempts so far, including this one
    pub retry_count: u32,
}

/// Bind `address` and start listening with a backlog of one.
///
/// While the address is in use the bind is retried following `policy`,
/// calling `on_retry` after each failure. Any other bind error is returned
/// straight away. Cancelling `cancel` cuts a backoff wait short.
pub fn listen_receiver(
    address: SocketAddr,
    policy: &BackoffPolicy,
    cancel: &CancelToken,
    mut on_retry: impl FnMut(&ConnectionAttempt),
) -> Result<Listener, TransportError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut retry_count = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        match bind_listener(address) {
            Ok(listener) => {
                if retry_count > 0 {
                    tracing::info!("Bound {} after {} retries", address, retry_count);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                let attempt = ConnectionAttempt {
                    address,
                    delay: policy.delay_for(retry_count),
                    retry_count: retry_count + 1,
                };
                on_retry(&attempt);

                if cancel.wait_timeout(attempt.delay) {
                    return Err(TransportError::Cancelled);
                }
                retry_count = attempt.retry_count;
                if retry_count >= max_attempts {
                    return Err(TransportError::BindExhausted {
                        address,
                        attempts: retry_count,
                    });
                }
            }
            Err(source) => return Err(TransportError::Bind { address, source }),
        }
    }
}

fn bind_listener(address: SocketAddr) -> io::Result<Listener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    // On Windows SO_REUSEADDR lets a second socket steal a port in active use
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Listener::new(socket.into())
}
