use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LedgerError;

/// Prefix for environment overrides, e.g. `AUDIT_LEDGER__CHAIN__CHECKPOINT_INTERVAL=500`.
pub const ENV_PREFIX: &str = "AUDIT_LEDGER";

/// Roughly seven years, the usual retention horizon for compliance records.
pub const DEFAULT_RETENTION_DAYS: i64 = 2555;

pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub signing: SigningConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://audit-ledger.db".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 10,
            busy_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Identifies an independent chain (one per tenant) inside the database.
    pub chain_id: String,
    pub checkpoint_interval: u64,
    /// Seal a checkpoint synchronously once `checkpoint_interval` events are pending.
    pub auto_checkpoint: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "default".to_string(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            auto_checkpoint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub key_dir: PathBuf,
    pub key_retention_days: i64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("keys"),
            key_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub backend: StorageBackendKind,
    pub root_path: PathBuf,
    pub retention_days: i64,
    pub export_on_checkpoint: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: StorageBackendKind::Filesystem,
            root_path: PathBuf::from("worm"),
            retention_days: DEFAULT_RETENTION_DAYS,
            export_on_checkpoint: true,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, LedgerError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!("Loading configuration from: {:?}", path);
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LedgerError::Configuration(format!("Failed to load config: {}", e)))?;

        let config: LedgerConfig = settings
            .try_deserialize()
            .map_err(|e| LedgerError::Configuration(format!("Invalid config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.database.url.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "database.url must not be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(LedgerError::Configuration(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        self.chain.validate()?;
        if self.signing.key_retention_days <= 0 {
            return Err(LedgerError::Configuration(
                "signing.key_retention_days must be positive".to_string(),
            ));
        }
        if self.storage.enabled && self.storage.retention_days <= 0 {
            return Err(LedgerError::Configuration(
                "storage.retention_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.chain_id.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "chain.chain_id must not be empty".to_string(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(LedgerError::Configuration(
                "chain.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chain.checkpoint_interval, 1000);
        assert!(config.chain.auto_checkpoint);
        assert_eq!(config.signing.key_retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = LedgerConfig::default();
        config.chain.checkpoint_interval = 0;
        assert!(matches!(
            config.validate(),
            Err(LedgerError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(
            &path,
            r#"
[chain]
chain_id = "tenant-a"
checkpoint_interval = 250

[storage]
enabled = true
backend = "memory"
"#,
        )
        .unwrap();

        let config = LedgerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.chain.chain_id, "tenant-a");
        assert_eq!(config.chain.checkpoint_interval, 250);
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.database.max_connections, 5);
    }
}
