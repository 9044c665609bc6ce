use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tollgate::config::Config;
use tollgate::proxy::ProxyPolicy;
use tollgate::server::{watch_signals, Proxy};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,

        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let proxy = Proxy::bind(config, Arc::new(ProxyPolicy)).await?;

    tokio::spawn(watch_signals(proxy.shutdown_handle()));

    proxy.serve().await
}
