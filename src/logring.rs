//! In-process log ring backing `GET /log`. A tracing layer copies every
//! record into a bounded deque and fans live records out to followers
//! through a broadcast channel.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const RING_CAPACITY: usize = 10_000;
const FOLLOW_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Unix timestamp, seconds.
    pub ts: f64,
    pub level: String,
    pub service: String,
    pub msg: String,
}

pub struct LogRing {
    ring: Mutex<VecDeque<LogRecord>>,
    live: broadcast::Sender<LogRecord>,
}

impl LogRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            live: broadcast::channel(FOLLOW_BUFFER).0,
        })
    }

    pub fn layer(self: &Arc<Self>) -> LogRingLayer {
        LogRingLayer { ring: self.clone() }
    }

    pub fn push(&self, record: LogRecord) {
        {
            let mut ring = self.ring.lock();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        let _ = self.live.send(record);
    }

    /// Records younger than `seek` seconds (0 = none).
    pub fn backlog(&self, seek: u64) -> Vec<LogRecord> {
        if seek == 0 {
            return Vec::new();
        }
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs_f64() - seek as f64)
            .unwrap_or(0.0);
        self.ring
            .lock()
            .iter()
            .filter(|record| record.ts >= since)
            .cloned()
            .collect()
    }

    pub fn follow(&self) -> broadcast::Receiver<LogRecord> {
        self.live.subscribe()
    }
}

pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl<S: tracing::Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs_f64())
            .unwrap_or(0.0);
        self.ring.push(LogRecord {
            ts,
            level: event.metadata().level().to_string().to_lowercase(),
            service: event.metadata().target().to_owned(),
            msg: visitor.rendered,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    rendered: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.rendered, "{value:?}");
        } else {
            if !self.rendered.is_empty() {
                self.rendered.push(' ');
            }
            let _ = write!(self.rendered, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.rendered.push_str(value);
        } else {
            if !self.rendered.is_empty() {
                self.rendered.push(' ');
            }
            let _ = write!(self.rendered, "{}={value}", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_filters_by_age() {
        let ring = LogRing::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        ring.push(LogRecord {
            ts: now - 100.0,
            level: "info".to_owned(),
            service: "kvmd".to_owned(),
            msg: "old".to_owned(),
        });
        ring.push(LogRecord {
            ts: now,
            level: "info".to_owned(),
            service: "kvmd".to_owned(),
            msg: "fresh".to_owned(),
        });
        assert!(ring.backlog(0).is_empty());
        let recent = ring.backlog(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].msg, "fresh");
        assert_eq!(ring.backlog(1000).len(), 2);
    }

    #[tokio::test]
    async fn follow_receives_live_records() {
        let ring = LogRing::new();
        let mut follower = ring.follow();
        ring.push(LogRecord {
            ts: 1.0,
            level: "error".to_owned(),
            service: "kvmd".to_owned(),
            msg: "boom".to_owned(),
        });
        let record = follower.recv().await.unwrap();
        assert_eq!(record.msg, "boom");
    }
}
