use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    // Config file path: first CLI arg, then env, then the local default.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MACRORELAY_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("macrorelay.toml"));

    let config = macrorelay::config::Config::load(&config_path)?;
    info!(
        config = %config_path.display(),
        host = %config.gateway.host,
        port = config.gateway.port,
        db = %config.database.path.display(),
        trigger = %config.trigger.base_url,
        "macrorelay starting"
    );

    macrorelay::gateway::run_gateway(config).await
}
