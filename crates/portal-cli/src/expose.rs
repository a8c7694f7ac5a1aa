//! `expose` command

use anyhow::{Context, Result};
use portal_client::{TunnelConfig, TunnelSession, TunnelSupervisor};
use portal_transport::RelayConnector;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::ExposeArgs;

/// Expose the services described by `args` until `shutdown` fires
pub async fn run<C: RelayConnector>(
    args: &ExposeArgs,
    connector: Arc<C>,
    shutdown: CancellationToken,
) -> Result<()> {
    match &args.config {
        Some(path) => {
            let config = TunnelConfig::load(path).context("load config")?;
            info!(
                path = %path.display(),
                services = config.services.len(),
                "Exposing services from config"
            );

            TunnelSupervisor::from_config(&config, connector)
                .with_origin(format!("config={}", path.display()))
                .run(shutdown)
                .await?;
        }
        None => {
            let config = TunnelConfig::from_flags(&args.relay, &args.host, args.port, &args.name)?;
            let service = config
                .services
                .first()
                .cloned()
                .context("no service configured")?;

            TunnelSession::new(service, Arc::new(config.directory()), connector)
                .with_origin("flags")
                .run(shutdown)
                .await?;
        }
    }

    info!("Tunnel stopped");
    Ok(())
}
