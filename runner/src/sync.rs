pub mod signals;

use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Shared flag to stop waiting on the scheduler, cloned into whoever may request the stop
///
/// Waiting on the token wakes up immediately once `cancel` is called from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<Inner>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.0.cancelled.lock() = true;
        self.0.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.lock()
    }

    /// Sleep for `duration` or until cancelled, returns whether the token was cancelled
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        // None when the duration does not fit, wait until cancelled then
        let deadline = Instant::now().checked_add(duration);
        let mut cancelled = self.0.cancelled.lock();

        while !*cancelled {
            match deadline {
                Some(deadline) => {
                    if self
                        .0
                        .condvar
                        .wait_until(&mut cancelled, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.0.condvar.wait(&mut cancelled),
            }
        }

        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn times_out_without_cancel() {
        let token = CancellationToken::new();
        let start = Instant::now();

        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let start = Instant::now();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        assert!(token.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(token.is_cancelled());
        canceller.join().unwrap();
    }

    #[test]
    fn unbounded_wait_ends_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        assert!(token.wait_timeout(Duration::from_secs(u64::MAX)));
        canceller.join().unwrap();
    }

    #[test]
    fn cancelled_token_does_not_wait() {
        let token = CancellationToken::new();
        token.cancel();

        assert!(token.wait_timeout(Duration::from_secs(30)));
    }
}
