// Trial grant module

pub mod identity;
pub mod service;
pub mod store;

pub use identity::{IdentifierSource, RequestOrigin, TrialRequestBody};
pub use service::{TrialGrantService, TrialServiceOptions};
pub use store::{MemoryTrialStore, SharedTrialStore, TrialStore};

use std::sync::Arc;
use std::time::Duration;

use crate::error::TrialError;
use crate::models::{AppConfig, StoreBackend};
use crate::modules::config::{resolve_db_path, validate_store_config};
use crate::modules::trial_db::SqliteTrialStore;
use crate::modules::trial_rest::RestTrialStore;

/// Construct the process-wide store handle from validated configuration.
pub fn build_store(config: &AppConfig) -> Result<SharedTrialStore, TrialError> {
    validate_store_config(&config.store, &config.trial)?;
    let store = &config.store;

    let handle: SharedTrialStore = match store.backend {
        StoreBackend::Memory => Arc::new(MemoryTrialStore::new()),
        StoreBackend::Sqlite => {
            let path = resolve_db_path(store).map_err(TrialError::Configuration)?;
            tracing::info!("Opening trial database at {}", path.display());
            Arc::new(
                SqliteTrialStore::open(&path, &store.table, &store.audit_table)
                    .map_err(|e| TrialError::Configuration(format!("sqlite: {}", e)))?,
            )
        }
        StoreBackend::Rest => {
            // validate_store_config guarantees both are present
            let url = store.url.as_deref().unwrap_or_default();
            let key = store.service_key.as_deref().unwrap_or_default();
            Arc::new(
                RestTrialStore::new(
                    url,
                    key,
                    &store.table,
                    &store.audit_table,
                    Duration::from_millis(store.timeout_ms),
                )
                .map_err(|e| TrialError::Configuration(format!("rest store: {}", e)))?,
            )
        }
    };
    Ok(handle)
}

/// Store plus service options, ready to hand to the HTTP layer.
pub fn build_service(config: &AppConfig) -> Result<TrialGrantService, TrialError> {
    let store = build_store(config)?;
    let options = TrialServiceOptions {
        store_timeout: Duration::from_millis(config.store.timeout_ms),
        persistence: config.trial.persistence,
        strict_single_grant: config.trial.strict_single_grant,
    };
    tracing::info!(
        "Trial service ready: store={} persistence={:?} strict={}",
        store.name(),
        options.persistence,
        options.strict_single_grant
    );
    Ok(TrialGrantService::new(store, options))
}
