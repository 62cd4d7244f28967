//! External video streamer control. The streamer is its own process; the
//! daemon only starts/stops it based on client presence and proxies
//! snapshots from its unix socket.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use kvmd_core::{ApiError, Notifier, NOTIFY_CHANGED};

use crate::config::StreamerSection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamerState {
    pub enabled: bool,
    pub running: bool,
}

struct Inner {
    child: Option<Child>,
    restart_requested: bool,
}

pub struct Streamer {
    config: StreamerSection,
    inner: Mutex<Inner>,
    notifier: Arc<Notifier>,
}

impl Streamer {
    pub fn new(config: StreamerSection, notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                child: None,
                restart_requested: false,
            }),
            notifier,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.cmd.is_empty()
    }

    pub async fn get_state(&self) -> StreamerState {
        let inner = self.inner.lock().await;
        StreamerState {
            enabled: self.is_enabled(),
            running: inner.child.is_some(),
        }
    }

    pub async fn request_restart(&self) {
        self.inner.lock().await.restart_requested = true;
    }

    /// Fetches a still frame from the streamer's own HTTP socket.
    pub async fn snapshot(&self) -> Result<Vec<u8>, ApiError> {
        use http_body_util::BodyExt;
        use hyper_util::rt::TokioIo;

        if !self.is_enabled() {
            return Err(ApiError::Unavailable("streamer is disabled".to_owned()));
        }
        let stream = tokio::net::UnixStream::connect(&self.config.unix_path)
            .await
            .map_err(|err| ApiError::Unavailable(format!("streamer socket: {err}")))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| ApiError::Unavailable(format!("streamer handshake: {err}")))?;
        tokio::spawn(conn);
        let request = http::Request::builder()
            .method("GET")
            .uri("http://localhost/snapshot")
            .header("Host", "localhost")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .expect("request build");
        let response = sender
            .send_request(request)
            .await
            .map_err(|err| ApiError::Unavailable(format!("streamer request: {err}")))?;
        if !response.status().is_success() {
            return Err(ApiError::Unavailable(format!(
                "streamer answered {}",
                response.status()
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ApiError::Unavailable(format!("streamer body: {err}")))?;
        Ok(body.to_bytes().to_vec())
    }

    /// Client-count-driven lifecycle: start with the first WS client,
    /// stop a grace period after the last one leaves.
    pub async fn systask(self: Arc<Self>, clients: impl Fn() -> usize + Send + Sync + 'static) {
        if !self.is_enabled() {
            std::future::pending::<()>().await;
        }
        let mut prev = 0usize;
        let mut shutdown_at: Option<Instant> = None;
        loop {
            let current = clients();
            if current > 0 {
                shutdown_at = None;
                if prev == 0 {
                    self.ensure_started().await;
                }
            } else if prev > 0 {
                shutdown_at = Some(Instant::now() + self.config.shutdown_delay);
            } else if let Some(deadline) = shutdown_at {
                if Instant::now() >= deadline {
                    self.ensure_stopped().await;
                    shutdown_at = None;
                }
            }

            let restart = {
                let mut inner = self.inner.lock().await;
                std::mem::take(&mut inner.restart_requested)
            };
            if restart {
                self.ensure_stopped().await;
                if current > 0 {
                    self.ensure_started().await;
                }
            }

            prev = current;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn ensure_started(&self) {
        let mut inner = self.inner.lock().await;
        if inner.child.is_some() {
            return;
        }
        info!("starting streamer");
        match Command::new(&self.config.cmd[0])
            .args(&self.config.cmd[1..])
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                inner.child = Some(child);
                drop(inner);
                self.notifier.notify(NOTIFY_CHANGED);
            }
            Err(err) => error!(%err, "can't start streamer"),
        }
    }

    async fn ensure_stopped(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            info!("stopping streamer");
            if let Err(err) = child.start_kill() {
                warn!(%err, "can't signal streamer");
            }
            let _ = child.wait().await;
            drop(inner);
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }

    pub async fn cleanup(&self) {
        self.ensure_stopped().await;
    }
}
