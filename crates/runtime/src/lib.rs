use std::sync::Arc;

use anyhow::{Context, Result};
use flowdock_client::FlowdockClient;
use flowdock_config::ClientConfig;
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::DEBUG)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

#[derive(Debug, Clone)]
pub struct ClientServices {
    pub client: Arc<FlowdockClient>,
}

impl ClientServices {
    /// Build the client from configuration and run its initial sync.
    pub async fn initialise(config: &ClientConfig) -> Result<Self> {
        let services = Self::connect(config)?;
        services
            .client
            .init()
            .await
            .context("failed to initialise flowdock client")?;

        let summary = services.client.summary().await;
        info!(
            organizations = summary.organizations,
            flows = summary.flows,
            joined = summary.joined_flows,
            users = summary.users,
            "flowdock client ready"
        );
        Ok(services)
    }

    /// Build the client without touching the network.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let client =
            FlowdockClient::new(config).context("failed to construct flowdock client")?;
        info!(api = %config.api.base_url, stream = %config.api.stream_url, "flowdock client configured");
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub async fn shutdown(&self) {
        self.client.destroy().await;
        info!("flowdock client stopped");
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
