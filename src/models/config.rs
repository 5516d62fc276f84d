use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::trial::identity::IdentifierSource;

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_body_bytes: 16 * 1024,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
    /// Supabase / PostgREST over HTTPS
    Rest,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Rest
    }
}

impl StoreBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            "rest" | "supabase" | "postgrest" => Some(Self::Rest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Base URL of the REST store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Service-role credential for the REST store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_audit_table")]
    pub audit_table: String,
    /// SQLite file; defaults to `<data_dir>/trials.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            service_key: None,
            table: default_table(),
            audit_table: default_audit_table(),
            db_path: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_table() -> String {
    "trial_users".to_string()
}

fn default_audit_table() -> String {
    "trial_attempts".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

// ============================================================================
// Trial policy
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// One record per identifier, replaced on re-grant
    Upsert,
    /// Upsert plus an append-only log of every attempt
    AuditLog,
}

impl Default for PersistenceMode {
    fn default() -> Self {
        Self::Upsert
    }
}

impl PersistenceMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "upsert" => Some(Self::Upsert),
            "audit_log" | "audit" => Some(Self::AuditLog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TrialConfig {
    pub identifier_source: IdentifierSource,
    pub persistence: PersistenceMode,
    /// Use the store's atomic conditional write instead of lookup + upsert
    pub strict_single_grant: bool,
    /// Echo storage diagnostics in `error_details` (debugging only)
    pub expose_error_details: bool,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub trial: TrialConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::new();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.store.backend, StoreBackend::Rest);
        assert_eq!(config.store.table, "trial_users");
        assert_eq!(config.store.timeout_ms, 5000);
        assert_eq!(config.trial.identifier_source, IdentifierSource::Hybrid);
        assert_eq!(config.trial.persistence, PersistenceMode::Upsert);
        assert!(!config.trial.strict_single_grant);
        assert!(!config.trial.expose_error_details);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let minimal = r#"{
            "store": { "backend": "rest", "url": "https://db.example.com" },
            "trial": { "identifier_source": "client_id" }
        }"#;
        let loaded: AppConfig = serde_json::from_str(minimal).unwrap();

        assert_eq!(loaded.store.backend, StoreBackend::Rest);
        assert_eq!(loaded.store.url.as_deref(), Some("https://db.example.com"));
        assert_eq!(loaded.store.table, "trial_users");
        assert_eq!(loaded.trial.identifier_source, IdentifierSource::ClientId);
        assert_eq!(loaded.trial.persistence, PersistenceMode::Upsert);
        assert_eq!(loaded.server.host, "127.0.0.1");
        assert_eq!(loaded.log.level, "info");
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(StoreBackend::parse("Supabase"), Some(StoreBackend::Rest));
        assert_eq!(StoreBackend::parse("memory"), Some(StoreBackend::Memory));
        assert_eq!(StoreBackend::parse("redis"), None);
        assert_eq!(PersistenceMode::parse("audit"), Some(PersistenceMode::AuditLog));
        assert_eq!(PersistenceMode::parse("append"), None);
    }

    #[test]
    fn test_roundtrip() {
        let mut config = AppConfig::new();
        config.trial.persistence = PersistenceMode::AuditLog;
        config.store.service_key = Some("secret".to_string());
        let content = serde_json::to_string_pretty(&config).unwrap();
        let loaded: AppConfig = serde_json::from_str(&content).unwrap();
        assert_eq!(config, loaded);
    }
}
