//! Client side of the persistent-state protocol: an HTTP GET for the
//! read path and a WebSocket session held open for the duration of a
//! write window (the server keeps the partition RW while any session
//! lives).

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use kvmd_server::parse_ws_event;

#[derive(Debug, Error)]
pub enum PstError {
    #[error("{0}")]
    Io(String),
    #[error("PST write is not allowed")]
    WriteNotAllowed,
    #[error("PST session ended before granting access")]
    NoGrant,
}

#[derive(Debug, Clone)]
pub struct PstClientConfig {
    pub unix_path: PathBuf,
    pub timeout: Duration,
}

pub struct PstClient {
    config: PstClientConfig,
}

/// Keeps the storage writable while alive; dropping it closes the WS
/// session and lets the server flip back to RO.
pub struct PstWriteSession {
    pub path: PathBuf,
    _ws: WebSocketStream<UnixStream>,
}

impl PstClient {
    pub fn new(config: PstClientConfig) -> Self {
        Self { config }
    }

    /// Read-side path of the data directory.
    pub async fn get_path(&self) -> Result<PathBuf, PstError> {
        let stream = self.connect().await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|err| PstError::Io(format!("PST handshake failed: {err}")))?;
        tokio::spawn(conn);

        let request = http::Request::builder()
            .method("GET")
            .uri("http://localhost/state")
            .header("Host", "localhost")
            .header("User-Agent", "kvmd")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .expect("request build");
        let response = tokio::time::timeout(self.config.timeout, sender.send_request(request))
            .await
            .map_err(|_| PstError::Io("PST state request timeout".to_owned()))?
            .map_err(|err| PstError::Io(format!("PST state request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(PstError::Io(format!("PST answered {}", response.status())));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| PstError::Io(format!("PST body read failed: {err}")))?
            .to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| PstError::Io(format!("bad PST payload: {err}")))?;
        let path = parsed["result"]["data"]["path"]
            .as_str()
            .ok_or_else(|| PstError::Io("PST payload misses data path".to_owned()))?;
        Ok(PathBuf::from(path))
    }

    /// Opens a write window. Waits for the server to confirm writability.
    pub async fn writable(&self) -> Result<PstWriteSession, PstError> {
        let stream = self.connect().await?;
        let (mut ws, _response) = tokio_tungstenite::client_async("ws://localhost/ws", stream)
            .await
            .map_err(|err| PstError::Io(format!("PST WS connect failed: {err}")))?;

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| PstError::Io("PST grant timeout".to_owned()))?;
            let Some(Ok(message)) = message else {
                return Err(PstError::NoGrant);
            };
            match message {
                Message::Text(raw) => {
                    let Some((event_type, event)) = parse_ws_event(&raw) else {
                        continue;
                    };
                    if event_type == "storage_state" {
                        if !event["data"]["write_allowed"].as_bool().unwrap_or(false) {
                            return Err(PstError::WriteNotAllowed);
                        }
                        let path = event["data"]["path"]
                            .as_str()
                            .ok_or_else(|| PstError::Io("PST event misses data path".to_owned()))?;
                        debug!(path, "PST write window open");
                        return Ok(PstWriteSession {
                            path: PathBuf::from(path),
                            _ws: ws,
                        });
                    }
                }
                Message::Close(_) => return Err(PstError::NoGrant),
                _ => {}
            }
        }
    }

    async fn connect(&self) -> Result<UnixStream, PstError> {
        UnixStream::connect(&self.config.unix_path)
            .await
            .map_err(|err| PstError::Io(format!("can't connect to PST socket: {err}")))
    }
}
