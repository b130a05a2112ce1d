use std::net::SocketAddr;

use fair_share_proxy::{
    fair_share::{FairShareSettings, server::ProxyServer},
    logging::{LogConfig, init_logging},
};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

#[tokio::main]
async fn main() -> Result<(), fair_share_proxy::Error> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let _log_guard = init_logging(&LogConfig::from_env())?;

    let settings = FairShareSettings::from_env().inspect_err(|error| {
        tracing::error!(%error, "Invalid configuration");
    })?;

    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
        .trim()
        .parse()?;

    tracing::info!(
        active_window_s = settings.active_window().as_secs_f64(),
        burst_window_s = settings.burst_window().as_secs_f64(),
        preferred_max_wait_s = settings.preferred_max_wait().as_secs_f64(),
        "Starting fair-share proxy"
    );

    ProxyServer::new(settings)?.run(addr).await?;
    Ok(())
}
