//! Bounded waits for lifecycle acknowledgments.
//!
//! A thread blocked in `open`/`close` registers under the instance slot and
//! parks; the interrupt handler unparks every thread registered for the slot
//! it just served. The unpark token makes a wake that races the park
//! harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use spin::Mutex;

#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: Mutex<Vec<(u64, usize, Thread)>>,
    next_ticket: AtomicU64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park until `done()` holds or `timeout` elapses; `true` if it held
    pub(crate) fn wait(&self, slot: usize, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        self.waiters.lock().push((ticket, slot, thread::current()));

        let satisfied = loop {
            if done() {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            thread::park_timeout(deadline - now);
        };

        self.waiters.lock().retain(|(t, _, _)| *t != ticket);
        satisfied
    }

    /// Wake the waiters of one slot
    pub(crate) fn wake(&self, slot: usize) {
        for (_, s, thread) in self.waiters.lock().iter() {
            if *s == slot {
                thread.unpark();
            }
        }
    }

    /// Wake everyone (recovery)
    pub(crate) fn wake_all(&self) {
        for (_, _, thread) in self.waiters.lock().iter() {
            thread.unpark();
        }
    }
}
