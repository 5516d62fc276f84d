pub mod error;
pub mod models;
pub mod modules;
pub mod server;
pub mod trial;

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::server::handlers::{AppState, ServiceSlot};
use crate::server::TrialServer;

/// `--config <path>` wins over `TRIAL_GATEWAY_CONFIG`.
/// `lookup` abstracts `std::env::var` for tests.
fn config_path_from_args<F>(args: &[String], lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    args.iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .or_else(|| {
            lookup(modules::CONFIG_PATH_ENV)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
        })
}

pub fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = config_path_from_args(&args, |key| std::env::var(key).ok());

    let config = modules::load_app_config(config_path.as_deref())
        .map_err(|e| anyhow!(e))
        .context("failed to load configuration")?;

    let _log_guard = modules::logger::init_logger(&config.log).map_err(|e| anyhow!(e))?;
    info!("Starting trial gateway v{}", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    rt.block_on(async {
        let built = trial::build_service(&config);
        if let Err(e) = &built {
            error!("Trial store unavailable, requests will fail: {}", e);
        }

        let state = AppState::new(ServiceSlot::from_result(built), config.trial.identifier_source)
            .with_error_details(config.trial.expose_error_details);

        let (server, handle) = TrialServer::start(
            &config.server.host,
            config.server.port,
            state,
            config.server.max_body_bytes,
        )
        .await
        .map_err(|e| anyhow!(e))?;

        tokio::signal::ctrl_c().await.ok();
        info!("Received ctrl-c, shutting down");
        server.stop().await;
        handle.await.context("server task failed")?;
        Ok(())
    })
}
