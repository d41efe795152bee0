//! Readiness descriptors
//!
//! A [`Descriptor`] is the poll-able object a channel exposes to the waitfor
//! multiplexer. It is level triggered: it stays readable while at least one
//! token is pending. The alert descriptor of a channel receives one token per
//! queued frame, so its pending count always equals the read queue length.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Number of descriptor slots on a channel
pub const MAX_FDS: usize = 8;
/// Slot holding the alert descriptor
pub const ALERT_FD: usize = MAX_FDS - 1;
/// Slot holding the timing descriptor that drives generators
pub const TIMING_FD: usize = MAX_FDS - 2;
/// First slot that is not available to technology drivers
pub const AST_MAX_TECH_FDS: usize = TIMING_FD;

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Level-triggered readiness counter with an optional exception bit
#[derive(Debug)]
pub struct Descriptor {
    id: u64,
    pending: AtomicUsize,
    exception: AtomicBool,
    notify: Notify,
}

impl Descriptor {
    pub fn new() -> Self {
        Self {
            id: NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed),
            pending: AtomicUsize::new(0),
            exception: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Convenience constructor returning a shared descriptor
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Identity, used to report which extra descriptor fired
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Add one pending token and wake any waiter
    pub fn signal(&self) {
        self.signal_n(1);
    }

    /// Add `n` pending tokens
    pub fn signal_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.pending.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Remove one pending token. Returns false if none was pending.
    pub fn consume(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_ok()
    }

    /// Remove every pending token, returning how many there were
    pub fn drain(&self) -> usize {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Raise the exception (priority) condition
    pub fn raise_exception(&self) {
        self.exception.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Clear the exception condition, returning whether it was set
    pub fn clear_exception(&self) -> bool {
        self.exception.swap(false, Ordering::AcqRel)
    }

    pub fn has_exception(&self) -> bool {
        self.exception.load(Ordering::Acquire)
    }

    /// True when a token or the exception condition is pending
    pub fn is_ready(&self) -> bool {
        self.pending() > 0 || self.has_exception()
    }

    /// Resolve once the descriptor is ready. Returns immediately if it already is.
    pub async fn readable(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_accounting() {
        let d = Descriptor::new();
        assert!(!d.is_ready());
        d.signal_n(3);
        assert_eq!(d.pending(), 3);
        assert!(d.consume());
        assert_eq!(d.drain(), 2);
        assert!(!d.consume());
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn test_readable_returns_when_pending() {
        let d = Descriptor::new();
        d.signal();
        tokio_test::block_on(d.readable());
        // Waiting does not consume
        assert_eq!(d.pending(), 1);
    }

    #[test]
    fn test_exception_bit() {
        let d = Descriptor::new();
        d.raise_exception();
        assert!(d.is_ready());
        assert!(d.clear_exception());
        assert!(!d.is_ready());
    }

    #[tokio::test]
    async fn test_readable_wakes_on_signal() {
        let d = Descriptor::shared();
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.readable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.signal();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_readable_is_level_triggered() {
        let d = Descriptor::new();
        d.signal();
        // still pending, resolves without a new signal
        tokio::time::timeout(Duration::from_millis(100), d.readable())
            .await
            .expect("ready descriptor resolves immediately");
        tokio::time::timeout(Duration::from_millis(100), d.readable())
            .await
            .expect("level triggered");
    }
}
