//! One-shot cancellation shared between the controller and a session worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

struct Inner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `signal` for every waiter at once
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Cancellation flag that blocking waits can select on.
///
/// Once cancelled it stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancel. Returns `false` if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.inner.trigger.lock().take());
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) when the token is cancelled.
    ///
    /// Nothing is ever sent on it; use it as a `select!` arm.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        !matches!(
            self.inner.signal.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_terminal() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert!(token.signal().recv().is_err());
    }

    #[test]
    fn test_wait_times_out() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_all_clones() {
        let token = CancelToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                thread::spawn(move || token.wait_timeout(Duration::from_secs(30)))
            })
            .collect();

        let started = Instant::now();
        thread::sleep(Duration::from_millis(30));
        token.cancel();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
