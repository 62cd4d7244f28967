use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{watch, Mutex};

/// Coalescing change notifier shared between a component and its polling
/// loop.
///
/// `notify()` never blocks and never grows a queue: notifications issued
/// while nobody waits are remembered as a single pending wakeup carrying
/// the maximum reason seen. Reason 0 means "state may have changed",
/// higher levels request a full resend. Intended for one consuming loop;
/// concurrent waiters serialize.
pub struct Notifier {
    tx: watch::Sender<u64>,
    rx: Mutex<watch::Receiver<u64>>,
    reason: AtomicU8,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(0u64);
        Self {
            tx,
            rx: Mutex::new(rx),
            reason: AtomicU8::new(0),
        }
    }

    pub fn notify(&self, reason: u8) {
        self.reason.fetch_max(reason, Ordering::AcqRel);
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Waits for a notification and returns the accumulated reason.
    /// Returns immediately if one is already pending.
    pub async fn wait(&self) -> u8 {
        let mut rx = self.rx.lock().await;
        let _ = rx.changed().await;
        self.reason.swap(0, Ordering::AcqRel)
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<u8> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(reason) => Some(reason),
            Err(_) => None,
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn notify_wakes_waiter_with_reason() {
        let notifier = Arc::new(Notifier::new());
        let waiter = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.wait().await })
        };
        tokio::task::yield_now().await;
        notifier.notify(1);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_notifications_coalesce_to_max() {
        let notifier = Notifier::new();
        notifier.notify(0);
        notifier.notify(1);
        notifier.notify(0);
        assert_eq!(notifier.wait_timeout(Duration::from_millis(50)).await, Some(1));
        // All three collapsed into one wakeup.
        assert_eq!(notifier.wait_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn wait_timeout_returns_none_when_idle() {
        let notifier = Notifier::new();
        assert_eq!(notifier.wait_timeout(Duration::from_millis(20)).await, None);
    }
}
