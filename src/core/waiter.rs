//! Cross-thread wake-up handle.
//!
//! A [`Waiter`] is a generation counter guarded by a condition variable. The
//! scheduling thread calls [`notify`](Waiter::notify); a client remembers the
//! last generation it saw and blocks until the counter moves past it, so a
//! notification that fires before the client starts waiting is never lost.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Waiter {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every thread blocked on this waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.condvar.notify_all();
    }

    /// Number of notifications so far.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until the generation exceeds `seen`; returns the new generation.
    pub fn wait_for(&self, seen: u64) -> u64 {
        let mut generation = self.generation.lock();
        while *generation <= seen {
            self.condvar.wait(&mut generation);
        }
        *generation
    }

    /// Like [`wait_for`](Self::wait_for) with a deadline.
    ///
    /// Returns `None` if no notification arrived within `timeout`.
    pub fn wait_timeout(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation <= seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        (*generation > seen).then_some(*generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let waiter = Waiter::new();
        waiter.notify();
        assert_eq!(waiter.wait_for(0), 1);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let waiter = Waiter::new();
        assert_eq!(waiter.wait_timeout(0, Duration::from_millis(10)), None);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let waiter = Arc::new(Waiter::new());
        let seen = waiter.generation();
        let notifier = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        assert_eq!(waiter.wait_timeout(seen, Duration::from_secs(5)), Some(1));
        handle.join().unwrap();
    }
}
