//! quorumd - coordinator and/or agent entry point.
//!
//! Role selection is environment-driven: `QUORUMD_SERVER=1` runs the
//! coordinator, `QUORUMD_SEED=<uri>` runs an agent against that
//! coordinator. A coordinator without a seed runs an embedded agent
//! against itself.

use std::sync::Arc;

use quorumd::users::DefaultSecondFactor;
use quorumd::{agent::AgentClient, api, Config, Server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let default_filter = if config.debug {
        "quorumd=debug,tower_http=debug"
    } else {
        "quorumd=info,tower_http=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !config.server_enabled && config.seed_uri.is_none() {
        anyhow::bail!("nothing to do: set QUORUMD_SERVER=1 and/or QUORUMD_SEED");
    }

    let mut coordinator = None;
    if config.server_enabled {
        let server = Server::new(config.clone(), Arc::new(DefaultSecondFactor)).await?;
        server.spawn_cleanup_loop();
        let api_server = server.clone();
        coordinator = Some(tokio::spawn(async move { api::serve(api_server).await }));
        info!(
            "Coordinator enabled on port {} (instance {})",
            config.server_port, server.instance_id
        );
    }

    if config.effective_seed_uri().is_some() {
        // Give an embedded agent's coordinator a moment to bind.
        if config.server_enabled {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        let client = AgentClient::start(config.clone()).await?;
        info!("Agent '{}' connected", config.hostname);
        drop(client);
    }

    match coordinator {
        // A fatal listen error ends the process with a non-zero exit.
        Some(handle) => handle.await??,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }
    Ok(())
}
