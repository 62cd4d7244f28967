//! WebSocket session registry: registration under a lock, snapshot-based
//! broadcast with per-session error suppression, heartbeat pings and the
//! text/binary dispatch tables.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Future, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct WsSession {
    pub id: u64,
    /// Free-form attributes supplied at registration (client kind etc).
    pub kwargs: Value,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSession {
    pub async fn send_event(&self, event_type: &str, event: &Value) -> bool {
        let payload = json!({
            "event_type": event_type,
            "event": event,
        });
        let message = Message::Text(payload.to_string());
        self.sink.lock().await.send(message).await.is_ok()
    }

    async fn ping(&self) -> bool {
        self.sink.lock().await.send(Message::Ping(Vec::new())).await.is_ok()
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}

pub fn parse_ws_event(raw: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let event_type = value.get("event_type")?.as_str()?.to_owned();
    let event = value.get("event")?.clone();
    if !event.is_object() {
        return None;
    }
    Some((event_type, event))
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TextHandler = Arc<dyn Fn(Arc<WsSession>, Value) -> BoxFuture + Send + Sync>;
type BinaryHandler = Arc<dyn Fn(Arc<WsSession>, Vec<u8>) -> BoxFuture + Send + Sync>;

/// Routing tables for incoming frames: text frames dispatch on
/// `event_type`, binary frames on their first byte.
#[derive(Default, Clone)]
pub struct WsDispatcher {
    text: HashMap<String, TextHandler>,
    binary: HashMap<u8, BinaryHandler>,
}

impl WsDispatcher {
    pub fn on_text<F, Fut>(&mut self, event_type: &str, handler: F)
    where
        F: Fn(Arc<WsSession>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let previous = self.text.insert(
            event_type.to_owned(),
            Arc::new(move |ws, event| Box::pin(handler(ws, event))),
        );
        debug_assert!(previous.is_none(), "duplicate WS handler");
    }

    pub fn on_binary<F, Fut>(&mut self, opcode: u8, handler: F)
    where
        F: Fn(Arc<WsSession>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let previous = self.binary.insert(
            opcode,
            Arc::new(move |ws, payload| Box::pin(handler(ws, payload))),
        );
        debug_assert!(previous.is_none(), "duplicate WS opcode handler");
    }
}

pub struct WsRegistry {
    sessions: Mutex<Vec<Arc<WsSession>>>,
    count: AtomicU64,
    heartbeat: Duration,
}

impl WsRegistry {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            count: AtomicU64::new(0),
            heartbeat,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Lock-free approximation for hot paths (streamer controller).
    pub fn count_sync(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub async fn snapshot(&self) -> Vec<Arc<WsSession>> {
        self.sessions.lock().await.clone()
    }

    /// Sends to every live session; failures are logged and skipped so
    /// one dead client never stalls the fan-out.
    pub async fn broadcast(&self, event_type: &str, event: &Value) {
        let sessions = self.snapshot().await;
        for session in sessions {
            if !session.send_event(event_type, event).await {
                debug!(session = session.id, "skipping dead WS session in broadcast");
            }
        }
    }

    pub async fn close_all(&self) -> bool {
        let sessions = {
            let mut guard = self.sessions.lock().await;
            self.count.store(0, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        let had_any = !sessions.is_empty();
        for session in sessions {
            session.close().await;
        }
        had_any
    }

    /// Runs one accepted socket to completion: registers the session,
    /// fires `on_open` (initial event push), dispatches frames, pings on
    /// the heartbeat, and deregisters on any exit path.
    pub async fn run_session<FOpen, FutOpen>(
        self: &Arc<Self>,
        socket: WebSocket,
        kwargs: Value,
        dispatcher: Arc<WsDispatcher>,
        on_open: FOpen,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Arc<WsSession>
    where
        FOpen: FnOnce(Arc<WsSession>) -> FutOpen,
        FutOpen: Future<Output = ()> + Send,
    {
        let (sink, stream) = socket.split();
        let session = Arc::new(WsSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            kwargs,
            sink: Mutex::new(sink),
        });

        {
            let mut sessions = self.sessions.lock().await;
            sessions.push(session.clone());
            self.count.store(sessions.len() as u64, Ordering::Release);
            info!(session = session.id, clients = sessions.len(), "registered WS client");
        }
        on_change();
        on_open(session.clone()).await;

        self.session_loop(session.clone(), stream, dispatcher).await;

        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|existing| existing.id != session.id);
            self.count.store(sessions.len() as u64, Ordering::Release);
            info!(session = session.id, clients = sessions.len(), "removed WS client");
        }
        session.close().await;
        on_change();
        session
    }

    async fn session_loop(
        &self,
        session: Arc<WsSession>,
        mut stream: SplitStream<WebSocket>,
        dispatcher: Arc<WsDispatcher>,
    ) {
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if !session.ping().await {
                        return;
                    }
                }
                message = stream.next() => {
                    let Some(Ok(message)) = message else { return };
                    match message {
                        Message::Text(raw) => match parse_ws_event(&raw) {
                            Some((event_type, event)) => {
                                if let Some(handler) = dispatcher.text.get(&event_type) {
                                    handler(session.clone(), event).await;
                                } else {
                                    warn!(event_type, "unknown WS event");
                                }
                            }
                            None => warn!("can't parse WS event"),
                        },
                        Message::Binary(payload) if !payload.is_empty() => {
                            let opcode = payload[0];
                            if let Some(handler) = dispatcher.binary.get(&opcode) {
                                handler(session.clone(), payload[1..].to_vec()).await;
                            } else {
                                warn!(opcode, "unknown WS binary opcode");
                            }
                        }
                        Message::Binary(_) | Message::Pong(_) | Message::Ping(_) => {}
                        Message::Close(_) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_parsing() {
        let (event_type, event) =
            parse_ws_event(r#"{"event_type": "key", "event": {"key": "KeyA", "state": true}}"#)
                .unwrap();
        assert_eq!(event_type, "key");
        assert_eq!(event["key"], "KeyA");

        assert!(parse_ws_event("[]").is_none());
        assert!(parse_ws_event(r#"{"event_type": 5, "event": {}}"#).is_none());
        assert!(parse_ws_event(r#"{"event_type": "x", "event": "str"}"#).is_none());
    }
}
