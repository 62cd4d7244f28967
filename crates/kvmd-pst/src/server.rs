//! The persistent-state server: keeps its partition read-only except
//! while at least one client session is connected, and broadcasts the
//! storage state to every session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::{error, info};

use kvmd_core::remount::Remounter;
use kvmd_core::Notifier;
use kvmd_server::{json_response, ws::WsDispatcher, ServerConfig, WsRegistry};

#[derive(Debug, Clone)]
pub struct PstServerConfig {
    pub data_path: PathBuf,
    pub remount_cmd: Vec<String>,
    pub ro_retries_delay: Duration,
    pub ro_cleanup_delay: Duration,
    pub heartbeat: Duration,
    pub server: ServerConfig,
}

pub struct PstServer {
    data_path: PathBuf,
    remounter: Remounter,
    ro_retries_delay: Duration,
    ro_cleanup_delay: Duration,
    ws: Arc<WsRegistry>,
    notifier: Arc<Notifier>,
}

#[derive(Clone)]
struct Ctx {
    server: Arc<PstServer>,
    dispatcher: Arc<WsDispatcher>,
}

impl PstServer {
    pub fn new(config: &PstServerConfig) -> Arc<Self> {
        Arc::new(Self {
            data_path: config.data_path.clone(),
            remounter: Remounter::new("PST", config.remount_cmd.clone()),
            ro_retries_delay: config.ro_retries_delay,
            ro_cleanup_delay: config.ro_cleanup_delay,
            ws: Arc::new(WsRegistry::new(config.heartbeat)),
            notifier: Arc::new(Notifier::new()),
        })
    }

    pub async fn run(
        self: Arc<Self>,
        server_config: ServerConfig,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        // Probe writability once so a broken helper shows up at startup.
        if self.remount(true).await {
            let _ = self.remount(false).await;
        }

        let mut dispatcher = WsDispatcher::default();
        {
            let server = self.clone();
            dispatcher.on_text("ping", move |session, _event| {
                let server = server.clone();
                async move {
                    let _ = session.send_event("pong", &json!({})).await;
                    let _ = server;
                }
            });
        }
        let ctx = Ctx {
            server: self.clone(),
            dispatcher: Arc::new(dispatcher),
        };

        let router = Router::new()
            .route("/state", get(state_handler))
            .route("/ws", get(ws_handler))
            .with_state(ctx);

        let controller = tokio::spawn(self.clone().controller());
        let result = kvmd_server::serve(server_config, router, shutdown).await;
        controller.abort();

        info!("disconnecting clients");
        self.broadcast_state(self.ws.count().await, false).await;
        if self.ws.close_all().await {
            tokio::time::sleep(self.ro_cleanup_delay).await;
        }
        let _ = self.remount(false).await;
        info!("cleanup complete");
        result.map_err(Into::into)
    }

    /// RW while clients exist, RO (with retries) once the last one
    /// leaves.
    async fn controller(self: Arc<Self>) {
        let mut prev = 0usize;
        loop {
            let current = self.ws.count().await;
            if current > 0 {
                if !self.is_write_available() {
                    self.remount(true).await;
                }
            } else if prev > 0 {
                while !self.remount(false).await {
                    if self.ws.count().await > 0 {
                        break;
                    }
                    tokio::time::sleep(self.ro_retries_delay).await;
                }
            }
            self.broadcast_state(current, self.is_write_available()).await;
            prev = current;
            self.notifier.wait().await;
        }
    }

    async fn broadcast_state(&self, clients: usize, write_allowed: bool) {
        self.ws
            .broadcast(
                "storage_state",
                &json!({
                    "clients": clients,
                    "data": {
                        "path": self.data_path,
                        "write_allowed": write_allowed,
                    },
                }),
            )
            .await;
    }

    pub fn state_payload(&self) -> serde_json::Value {
        json!({
            "data": {
                "path": self.data_path,
                "write_allowed": self.is_write_available(),
            },
        })
    }

    fn is_write_available(&self) -> bool {
        match nix::sys::statvfs::statvfs(&self.data_path) {
            Ok(stat) => !stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY),
            Err(err) => {
                info!(%err, path = %self.data_path.display(), "can't stat PST filesystem");
                false
            }
        }
    }

    async fn remount(&self, rw: bool) -> bool {
        match self.remounter.remount(rw).await {
            Ok(()) => {
                if rw {
                    // The data dir may not survive a mkfs.
                    if let Err(err) = tokio::fs::create_dir_all(&self.data_path).await {
                        error!(%err, "can't create PST data dir");
                        return false;
                    }
                }
                true
            }
            Err(err) => {
                error!(%err, rw, "PST remount failed");
                false
            }
        }
    }
}

async fn state_handler(State(ctx): State<Ctx>) -> Response {
    json_response(&ctx.server.state_payload())
}

async fn ws_handler(State(ctx): State<Ctx>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let server = ctx.server.clone();
        let notifier = server.notifier.clone();
        let on_change = move || notifier.notify(kvmd_core::NOTIFY_CHANGED);
        let registry = server.ws.clone();
        registry
            .run_session(
                socket,
                json!({}),
                ctx.dispatcher.clone(),
                |session| async move {
                    let _ = session.send_event("loop", &json!({})).await;
                },
                on_change,
            )
            .await;
    })
}
