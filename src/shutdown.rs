use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Gate for in-flight work during shutdown.
///
/// Every slot attempt holds a [`LatchPermit`] for its duration. Once the
/// latch is closed no new permits are granted, and
/// [`ShutdownLatch::close_and_wait`] resolves when the last permit drops.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    closed: AtomicBool,
    active: AtomicUsize,
    drained: Notify,
}

/// RAII permit; dropping it releases the latch on every exit path.
#[derive(Debug)]
pub struct LatchPermit<'a> {
    latch: &'a ShutdownLatch,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a permit, or `None` once the latch is closed.
    pub fn acquire(&self) -> Option<LatchPermit<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            // Lost the race against close(); back out.
            self.release();
            return None;
        }
        Some(LatchPermit { latch: self })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the latch; running work keeps its permits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }

    /// Closes the latch and waits for active permits to drain.
    pub async fn close_and_wait(&self) {
        self.close();
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl Drop for LatchPermit<'_> {
    fn drop(&mut self) {
        self.latch.release();
    }
}
