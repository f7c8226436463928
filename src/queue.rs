//! Per-port free-buffer queue.
//!
//! The feeder pops, the dispatcher pushes recycled buffers back. Any free
//! buffer is interchangeable, but insertion order is preserved so tests see
//! deterministic recycling. Waiters are woken by broadcast so a pop racing
//! its timeout against a push never loses the wakeup.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Port;

/// Why a blocking pop returned without a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// No buffer arrived within the bound; the device is not releasing
    /// buffers and the session must shut down.
    TimedOut,
    /// The queue was closed by session shutdown.
    Closed,
}

struct Inner {
    slots: VecDeque<u32>,
    closed: bool,
}

/// FIFO of free hardware-buffer indices for one port.
pub struct PortQueue {
    port: Port,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl PortQueue {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Append a buffer index and wake all waiters.
    pub fn push(&self, index: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.push_back(index);
        self.available.notify_all();
    }

    /// Pop the oldest free buffer, blocking up to `timeout`.
    pub fn pop_or_wait(&self, timeout: Duration) -> Result<u32, PopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(PopError::Closed);
            }
            if let Some(index) = inner.slots.pop_front() {
                return Ok(index);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(port = %self.port, ?timeout, "pop timed out");
                return Err(PopError::TimedOut);
            }
            let (guard, _) = self.available.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }
        inner.slots.pop_front()
    }

    /// Close the queue and wake all waiters; subsequent pops return
    /// [`PopError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = PortQueue::new(Port::Output);
        q.push(2);
        q.push(0);
        q.push(1);
        assert_eq!(q.pop_or_wait(Duration::from_millis(10)), Ok(2));
        assert_eq!(q.pop_or_wait(Duration::from_millis(10)), Ok(0));
        assert_eq!(q.pop_or_wait(Duration::from_millis(10)), Ok(1));
    }

    #[test]
    fn empty_pop_times_out() {
        let q = PortQueue::new(Port::Capture);
        let start = Instant::now();
        assert_eq!(
            q.pop_or_wait(Duration::from_millis(30)),
            Err(PopError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn push_wakes_blocked_popper() {
        let q = Arc::new(PortQueue::new(Port::Output));
        let popper = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_or_wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(7);
        assert_eq!(popper.join().unwrap(), Ok(7));
    }

    #[test]
    fn close_wakes_blocked_popper() {
        let q = Arc::new(PortQueue::new(Port::Output));
        let popper = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_or_wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(popper.join().unwrap(), Err(PopError::Closed));
    }

    /// Every pushed index is observed by exactly one popper: no loss, no
    /// duplication, under concurrent pushers and poppers.
    #[test]
    fn concurrent_push_pop_conserves_buffers() {
        const PER_PUSHER: u32 = 200;
        let q = Arc::new(PortQueue::new(Port::Capture));

        let pushers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PUSHER {
                        q.push(p * PER_PUSHER + i);
                    }
                })
            })
            .collect();

        let poppers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..PER_PUSHER {
                        seen.push(q.pop_or_wait(Duration::from_secs(10)).unwrap());
                    }
                    seen
                })
            })
            .collect();

        for p in pushers {
            p.join().unwrap();
        }
        let mut all: Vec<u32> = poppers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u32> = (0..4 * PER_PUSHER).collect();
        assert_eq!(all, expected);
    }
}
