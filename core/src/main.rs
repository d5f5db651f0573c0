/// NexusChat credential server - main entry point
use nexuschat_core::credential_api::start_credential_api;
use nexuschat_core::ServerConfig;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = ServerConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting NexusChat credential server");
    info!("   Listen: {}", config.listen_addr);

    start_credential_api(config).await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
