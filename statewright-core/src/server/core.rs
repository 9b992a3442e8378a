//! Engine server: recovery, timer loop and HTTP API

use crate::models::configuration::Configuration;
use crate::models::definition::StateMachineDefinition;
use crate::workflow::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Long-running engine process
pub struct StatewrightServer {
    config: Configuration,
    orchestrator: Orchestrator,
}

impl StatewrightServer {
    pub fn new(config: Configuration, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Recover persisted executions, then serve until Ctrl+C
    pub async fn start(self) -> Result<()> {
        let address: SocketAddr = format!("{}:{}", self.config.server_host, self.config.server_port)
            .parse()
            .context("Invalid server address")?;

        if let Some(dir) = &self.config.definitions_dir {
            let loaded = load_definitions_dir(&self.orchestrator, dir)?;
            tracing::info!("Loaded {} definitions from {}", loaded, dir.display());
        }

        let report = self
            .orchestrator
            .recover()
            .await
            .context("Failed to recover executions")?;
        tracing::info!(
            "Recovery: {} definitions, {} executions resumed, {} timers, {} callbacks re-dispatched, {} discarded",
            report.definitions,
            report.resumed,
            report.timers,
            report.redispatched,
            report.discarded
        );

        let timer_task = self
            .orchestrator
            .spawn_timer_loop(Duration::from_millis(self.config.timer_tick_ms.max(1)));

        let routes = crate::server::api::create_api_routes(self.orchestrator.clone());
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(address, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
            })
            .with_context(|| format!("Failed to bind to {}", address))?;

        println!("statewright server listening on http://{}", bound);
        println!("Press Ctrl+C to stop the server");

        server.await;
        println!("\nShutting down server...");
        timer_task.abort();
        Ok(())
    }
}

/// Register every `.yaml`, `.yml` and `.json` definition found in `dir`
pub fn load_definitions_dir(orchestrator: &Orchestrator, dir: &Path) -> Result<usize> {
    let mut loaded = 0;
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read definitions directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml" | "json")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let definition = match StateMachineDefinition::load_from_file(&path) {
            Ok(definition) => definition,
            Err(e) => {
                tracing::warn!("Skipping {}: {:#}", path.display(), e);
                continue;
            }
        };
        match orchestrator.register_definition(definition) {
            Ok(_) => loaded += 1,
            Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(loaded)
}
