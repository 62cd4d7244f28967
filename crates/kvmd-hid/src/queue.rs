//! Epoch-tagged event queue between the async front and a backend worker
//! thread. "Clearing" bumps the epoch so the worker silently drops
//! everything enqueued before the clear, without the sender needing to
//! reach into the receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

const QUEUE_DEPTH: usize = 1024;

pub struct EventSender<T> {
    tx: SyncSender<(u64, T)>,
    epoch: Arc<AtomicU64>,
}

pub struct EventReceiver<T> {
    rx: Receiver<(u64, T)>,
    epoch: Arc<AtomicU64>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            epoch: self.epoch.clone(),
        }
    }
}

pub fn event_queue<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = sync_channel(QUEUE_DEPTH);
    let epoch = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            epoch: epoch.clone(),
        },
        EventReceiver { rx, epoch },
    )
}

impl<T> EventSender<T> {
    /// Enqueue; a full queue drops the event (the worker is wedged anyway
    /// and a Clear will follow).
    pub fn send(&self, event: T) {
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Err(TrySendError::Full(_)) = self.tx.try_send((epoch, event)) {
            tracing::warn!("event queue full, dropping event");
        }
    }

    /// Invalidates everything already queued, then enqueues `event`.
    pub fn clear_and_send(&self, event: T) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(TrySendError::Full(_)) = self.tx.try_send((epoch, event)) {
            tracing::warn!("event queue full, dropping clear event");
        }
    }
}

pub enum Recv<T> {
    Event(T),
    Timeout,
    Disconnected,
}

impl<T> EventReceiver<T> {
    /// Blocking receive with timeout; stale-epoch events are skipped
    /// within the same deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Recv<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok((epoch, event)) => {
                    if epoch == self.epoch.load(Ordering::Acquire) {
                        return Recv::Event(event);
                    }
                    // Stale: cleared while queued.
                }
                Err(RecvTimeoutError::Timeout) => return Recv::Timeout,
                Err(RecvTimeoutError::Disconnected) => return Recv::Disconnected,
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_flow_in_order() {
        let (tx, rx) = event_queue::<u32>();
        tx.send(1);
        tx.send(2);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Event(1)));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Event(2)));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Timeout));
    }

    #[test]
    fn clear_drops_queued_events() {
        let (tx, rx) = event_queue::<u32>();
        tx.send(1);
        tx.send(2);
        tx.clear_and_send(3);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Event(3)));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Timeout));
    }

    #[test]
    fn disconnect_is_reported() {
        let (tx, rx) = event_queue::<u32>();
        drop(tx);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), Recv::Disconnected));
    }
}
