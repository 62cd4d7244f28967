//! Privileged remount helper invocation. The daemons never call mount(2)
//! themselves; a configured command does it, with `{mode}` expanding to
//! `rw` or `ro`.

use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Remounter {
    name: &'static str,
    cmd: Option<Vec<String>>,
}

impl Remounter {
    pub fn new(name: &'static str, cmd: Vec<String>) -> Self {
        Self {
            name,
            cmd: if cmd.is_empty() { None } else { Some(cmd) },
        }
    }

    /// No-op remounter for always-writable storages (tests, plain dirs).
    pub fn disabled(name: &'static str) -> Self {
        Self { name, cmd: None }
    }

    pub async fn remount(&self, rw: bool) -> Result<(), String> {
        let Some(cmd) = &self.cmd else {
            return Ok(());
        };
        let mode = if rw { "rw" } else { "ro" };
        let argv: Vec<String> = cmd.iter().map(|arg| arg.replace("{mode}", mode)).collect();
        info!(name = self.name, mode, "remounting storage");
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .await
            .map_err(|err| format!("can't spawn remount helper: {err}"))?;
        if !status.success() {
            return Err(format!("remount helper failed with {status}"));
        }
        Ok(())
    }
}
