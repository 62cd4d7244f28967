use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kvmd::config::{Args, KvmdConfig};
use kvmd::logring::LogRing;

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let logring = LogRing::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logring.layer())
        .init();

    let config = match KvmdConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return std::process::ExitCode::from(2);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    match runtime.block_on(kvmd::server::run(config, logring)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal error");
            std::process::ExitCode::FAILURE
        }
    }
}
