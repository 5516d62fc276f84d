use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrialError;
use crate::models::{AppConfig, PersistenceMode, StoreBackend, StoreConfig, TrialConfig};
use crate::trial::identity::IdentifierSource;

const DATA_DIR_NAME: &str = "trial-gateway";
const DB_FILE: &str = "trials.db";

/// Environment variable naming an optional JSON config file
pub const CONFIG_PATH_ENV: &str = "TRIAL_GATEWAY_CONFIG";

/// Get data directory path, creating it when missing
pub fn get_data_dir() -> Result<PathBuf, String> {
    // Support custom data directory via environment variable
    if let Ok(env_path) = std::env::var("TRIAL_GATEWAY_DATA_DIR") {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            if !data_dir.exists() {
                fs::create_dir_all(&data_dir)
                    .map_err(|e| format!("failed_to_create_custom_data_dir: {}", e))?;
            }
            return Ok(data_dir);
        }
    }

    let base = dirs::data_dir().ok_or("failed_to_get_data_dir")?;
    let data_dir = base.join(DATA_DIR_NAME);

    if !data_dir.exists() {
        fs::create_dir_all(&data_dir).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
    }

    Ok(data_dir)
}

/// Load configuration: JSON file (if given and present) then environment overrides
pub fn load_app_config(path: Option<&Path>) -> Result<AppConfig, String> {
    let mut config = match path {
        Some(p) if p.exists() => read_config_file(p)?,
        Some(p) => {
            tracing::warn!("Config file {} not found, using defaults", p.display());
            AppConfig::new()
        }
        None => AppConfig::new(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<AppConfig, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("failed_to_read_config_file: {}", e))?;

    // Parse via Value first to support future migration logic
    let v: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("failed_to_parse_config_file: {}", e))?;

    serde_json::from_value(v).map_err(|e| format!("failed_to_convert_config: {}", e))
}

/// Apply environment overrides. `lookup` abstracts `std::env::var` for tests.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = get("TRIAL_GATEWAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = get("TRIAL_GATEWAY_PORT") {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| format!("invalid_port: {}", port))?;
    }
    if let Some(size) = get("TRIAL_GATEWAY_MAX_BODY_SIZE") {
        config.server.max_body_bytes = size
            .trim()
            .parse()
            .map_err(|_| format!("invalid_max_body_size: {}", size))?;
    }

    if let Some(backend) = get("TRIAL_GATEWAY_STORE") {
        config.store.backend = StoreBackend::parse(&backend)
            .ok_or_else(|| format!("invalid_store_backend: {}", backend))?;
    }
    if let Some(url) = get("SUPABASE_URL") {
        config.store.url = Some(url);
    }
    if let Some(key) = get("SUPABASE_SERVICE_ROLE_KEY") {
        config.store.service_key = Some(key);
    }
    if let Some(table) = get("TRIAL_GATEWAY_TABLE") {
        config.store.table = table;
    }
    if let Some(path) = get("TRIAL_GATEWAY_DB_PATH") {
        config.store.db_path = Some(PathBuf::from(path));
    }
    if let Some(ms) = get("TRIAL_GATEWAY_STORE_TIMEOUT_MS") {
        config.store.timeout_ms = ms
            .trim()
            .parse()
            .map_err(|_| format!("invalid_store_timeout: {}", ms))?;
    }

    if let Some(source) = get("TRIAL_GATEWAY_IDENTIFIER") {
        config.trial.identifier_source = IdentifierSource::parse(&source)
            .ok_or_else(|| format!("invalid_identifier_source: {}", source))?;
    }
    if let Some(mode) = get("TRIAL_GATEWAY_PERSISTENCE") {
        config.trial.persistence = PersistenceMode::parse(&mode)
            .ok_or_else(|| format!("invalid_persistence_mode: {}", mode))?;
    }
    if let Some(flag) = get("TRIAL_GATEWAY_STRICT") {
        config.trial.strict_single_grant = parse_bool("TRIAL_GATEWAY_STRICT", &flag)?;
    }
    if let Some(flag) = get("TRIAL_GATEWAY_EXPOSE_ERRORS") {
        config.trial.expose_error_details = parse_bool("TRIAL_GATEWAY_EXPOSE_ERRORS", &flag)?;
    }

    if let Some(level) = get("TRIAL_GATEWAY_LOG") {
        config.log.level = level;
    }
    if let Some(dir) = get("TRIAL_GATEWAY_LOG_DIR") {
        config.log.dir = Some(PathBuf::from(dir));
    }

    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("invalid_bool for {}: {}", key, raw)),
    }
}

/// Check that the store settings are usable before any request reaches it.
pub fn validate_store_config(store: &StoreConfig, trial: &TrialConfig) -> Result<(), TrialError> {
    if !is_table_name(&store.table) {
        return Err(TrialError::Configuration(format!(
            "invalid table name: {:?}",
            store.table
        )));
    }
    if !is_table_name(&store.audit_table) {
        return Err(TrialError::Configuration(format!(
            "invalid audit table name: {:?}",
            store.audit_table
        )));
    }
    if store.timeout_ms == 0 {
        return Err(TrialError::Configuration("store timeout must be positive".to_string()));
    }

    if store.backend == StoreBackend::Rest {
        let raw_url = store
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| TrialError::Configuration("SUPABASE_URL is missing".to_string()))?;
        let parsed = url::Url::parse(raw_url)
            .map_err(|e| TrialError::Configuration(format!("invalid store url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TrialError::Configuration(format!(
                "unsupported store url scheme: {}",
                parsed.scheme()
            )));
        }
        if store
            .service_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty())
        {
            return Err(TrialError::Configuration(
                "SUPABASE_SERVICE_ROLE_KEY is missing".to_string(),
            ));
        }
        if trial.strict_single_grant {
            return Err(TrialError::Configuration(
                "strict_single_grant is not supported by the rest store".to_string(),
            ));
        }
    }

    Ok(())
}

/// Resolve the SQLite file location
pub fn resolve_db_path(store: &StoreConfig) -> Result<PathBuf, String> {
    match &store.db_path {
        Some(path) => Ok(path.clone()),
        None => Ok(get_data_dir()?.join(DB_FILE)),
    }
}

fn is_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
