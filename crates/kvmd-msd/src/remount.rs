//! MSD storage remounting, bridged onto the shared helper runner.

use crate::MsdError;

#[derive(Debug, Clone)]
pub struct Remounter {
    inner: kvmd_core::remount::Remounter,
}

impl Remounter {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            inner: kvmd_core::remount::Remounter::new("MSD", cmd),
        }
    }

    /// No-op remounter for storages that are always writable (tests,
    /// plain directories).
    pub fn disabled() -> Self {
        Self {
            inner: kvmd_core::remount::Remounter::disabled("MSD"),
        }
    }

    pub async fn remount(&self, rw: bool) -> Result<(), MsdError> {
        self.inner.remount(rw).await.map_err(MsdError::Internal)
    }
}
