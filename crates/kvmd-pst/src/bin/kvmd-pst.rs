use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kvmd_pst::{PstServer, PstServerConfig};
use kvmd_server::ServerConfig;

/// Persistent-state storage daemon.
#[derive(Parser)]
#[command(name = "kvmd-pst", version)]
struct Args {
    /// Unix socket to listen on.
    #[arg(long, default_value = "/run/kvmd/pst.sock")]
    unix: PathBuf,

    /// chmod bits for the socket file (octal).
    #[arg(long, default_value = "660")]
    unix_mode: String,

    /// fstab to scan for the X-kvmd.pst-root tag.
    #[arg(long, default_value = "/etc/fstab")]
    fstab: PathBuf,

    /// Explicit storage root (overrides the fstab lookup).
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Remount helper; {mode} expands to rw/ro.
    #[arg(long = "remount-cmd", num_args = 0.., default_values_t = [
        "/usr/bin/sudo".to_owned(),
        "--non-interactive".to_owned(),
        "/usr/bin/kvmd-helper-pst-remount".to_owned(),
        "{mode}".to_owned(),
    ])]
    remount_cmd: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let root = match args.storage {
        Some(root) => root,
        None => {
            kvmd_core::fstab::find_pst(&args.fstab)
                .context("can't find the PST partition in fstab")?
                .root_path
        }
    };
    let unix_mode = u32::from_str_radix(&args.unix_mode, 8).context("bad socket mode")?;

    let config = PstServerConfig {
        data_path: root.join("data"),
        remount_cmd: args.remount_cmd,
        ro_retries_delay: Duration::from_secs(10),
        ro_cleanup_delay: Duration::from_secs(3),
        heartbeat: Duration::from_secs(15),
        server: ServerConfig {
            unix_path: args.unix,
            unix_rm: true,
            unix_mode: Some(unix_mode),
        },
    };

    let server = PstServer::new(&config);
    server
        .run(config.server.clone(), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
