//! Meshframe instance runner.
//!
//! Boots a single fabric instance from environment configuration and keeps
//! it alive until Ctrl-C, at which point presence and registered routes are
//! retired from the coordinator before the process exits.

use meshframe::config::FabricConfig;
use meshframe::facade::Fabric;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FabricConfig::from_env()?;

    #[cfg(feature = "otel")]
    let _guard = meshframe::otel::ObservabilityBuilder::new(&config.service_name)
        .environment_from_env()
        .otlp_endpoint_from_env()
        .log_level_from_env()
        .build()?;

    let fabric = Fabric::builder(&config.service_name)
        .config(config)
        .build()
        .await?;

    fabric.start().await?;

    tokio::signal::ctrl_c().await?;
    fabric.shutdown().await?;

    Ok(())
}
