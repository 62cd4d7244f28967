//! Unix-socket HTTP serving. axum no longer drives non-TCP listeners
//! itself, so connections are accepted here and handed to hyper's
//! connection builder with upgrade support (needed for WebSockets). Peer
//! credentials are captured per connection and stashed in request
//! extensions for the auth pipeline.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info};

use crate::auth::PeerCreds;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub unix_path: PathBuf,
    /// Remove a stale socket file before binding.
    pub unix_rm: bool,
    /// chmod bits for the socket file, e.g. 0o660.
    pub unix_mode: Option<u32>,
}

pub async fn serve(
    config: ServerConfig,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if config.unix_rm && config.unix_path.exists() {
        std::fs::remove_file(&config.unix_path)?;
    }
    let listener = UnixListener::bind(&config.unix_path)?;
    if let Some(mode) = config.unix_mode {
        std::fs::set_permissions(&config.unix_path, std::fs::Permissions::from_mode(mode))?;
    }
    info!(path = %config.unix_path.display(), "HTTP server listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "accept failed");
                    continue;
                }
            },
            () = &mut shutdown => {
                info!("HTTP server shutting down");
                return Ok(());
            }
        };

        let creds = stream
            .peer_cred()
            .ok()
            .map(|creds| PeerCreds { uid: creds.uid() });
        let router = router.clone();

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
                if let Some(creds) = creds {
                    request.extensions_mut().insert(creds);
                }
                router.clone().call(request)
            });
            let io = TokioIo::new(stream);
            let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await;
            if let Err(err) = result {
                debug!(%err, "connection error");
            }
        });
    }
}
