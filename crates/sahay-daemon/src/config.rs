//! Daemon configuration.
//!
//! Loaded from a TOML file; every section defaults so a bare `sahay.toml`
//! (or none at all) yields a runnable pilot instance. CLI arguments
//! override file values in `main`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration load errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML or fails the schema.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SahayConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub blobs: BlobsConfig,
    pub analytics: AnalyticsConfig,
    pub consent: ConsentConfig,
    pub sealing: SealingConfig,
    pub scheduler: SchedulerConfig,
    /// SLA durations per (category, escalation level); unlisted pairs use
    /// built-in defaults.
    pub sla: Vec<SlaRuleConfig>,
}

impl SahayConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read or parse failure.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sahay.db"),
        }
    }
}

/// Blob store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlobsConfig {
    /// Root directory for content-addressed blobs.
    pub root: PathBuf,
}

impl Default for BlobsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("blobs"),
        }
    }
}

/// Analytics pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsConfig {
    /// k-anonymity threshold applied by every query surface.
    pub k_threshold: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { k_threshold: 5 }
    }
}

/// Consent settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsentConfig {
    /// Active consent-document version. Raising it invalidates every grant
    /// made under older documents until users re-consent.
    pub document_version: u32,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            document_version: 1,
        }
    }
}

/// Complaint payload sealing settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SealingConfig {
    /// Hex-encoded 32-byte key. Absent: a random per-process key is used
    /// and sealed payloads do not survive a restart.
    pub key_hex: Option<String>,
}

/// Periodic job cadence, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub sla_tick_secs: u64,
    pub anchor_tick_secs: u64,
    pub outbox_tick_secs: u64,
    pub flush_tick_secs: u64,
    pub view_refresh_secs: u64,
    /// Advisory-lock lease; an instance that dies mid-job frees the job
    /// after this long.
    pub lock_lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sla_tick_secs: 60,
            anchor_tick_secs: 30,
            outbox_tick_secs: 30,
            flush_tick_secs: 300,
            view_refresh_secs: 600,
            lock_lease_secs: 300,
        }
    }
}

/// One SLA rule row.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlaRuleConfig {
    /// Complaint category.
    pub category: String,
    /// Escalation level (`district`, `state`, `national`).
    pub level: String,
    /// Hours allowed at this level.
    pub hours: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = SahayConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.analytics.k_threshold, 5);
        assert_eq!(config.consent.document_version, 1);
        assert!(config.sla.is_empty());
    }

    #[test]
    fn parses_partial_file() {
        let raw = r#"
            [server]
            bind = "0.0.0.0:9090"

            [analytics]
            k_threshold = 10

            [[sla]]
            category = "medication_error"
            level = "district"
            hours = 24
        "#;
        let config: SahayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9090");
        assert_eq!(config.analytics.k_threshold, 10);
        assert_eq!(config.scheduler.sla_tick_secs, 60);
        assert_eq!(config.sla.len(), 1);
        assert_eq!(config.sla[0].hours, 24);
    }

    #[test]
    fn unknown_fields_rejected() {
        let raw = r#"
            [server]
            bindd = "typo"
        "#;
        assert!(toml::from_str::<SahayConfig>(raw).is_err());
    }
}
