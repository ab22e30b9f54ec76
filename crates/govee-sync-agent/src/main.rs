use anyhow::Result;
use govee_sync_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so GOVEE_DEBUG can pick the log level
    let config = AgentConfig::from_env()?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting govee-sync agent"
    );

    let agent = Agent::new(config)?;

    // Run agent
    agent.run().await?;

    Ok(())
}
