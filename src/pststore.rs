//! Glue between the switch persistence trait and the PST client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use kvmd_pst::{PstClient, PstClientConfig};
use kvmd_switch::storage::PersistentStorage;

pub struct PstStore {
    client: PstClient,
}

impl PstStore {
    pub fn new(unix_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            client: PstClient::new(PstClientConfig {
                unix_path,
                timeout: Duration::from_secs(5),
            }),
        })
    }
}

#[async_trait]
impl PersistentStorage for PstStore {
    async fn readable(&self) -> Option<PathBuf> {
        match self.client.get_path().await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%err, "PST is unreachable for reading");
                None
            }
        }
    }

    async fn writable(&self) -> Option<(PathBuf, Box<dyn std::any::Any + Send>)> {
        match self.client.writable().await {
            Ok(session) => {
                let path = session.path.clone();
                Some((path, Box::new(session)))
            }
            Err(err) => {
                warn!(%err, "PST is unreachable for writing");
                None
            }
        }
    }
}
