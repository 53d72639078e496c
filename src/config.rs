//! The closed configuration surface from spec §6, layered the way the
//! teacher's `mmoldb_ingest::config::IngestConfig` is: built-in defaults,
//! overridden by an optional TOML file, overridden by `ARENA_`-prefixed
//! environment variables. Every section rejects unknown keys so a typo in a
//! config file fails fast instead of silently doing nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arena_collector::CollectorConfig;
use arena_db::backend::embedded::{EmbeddedBackend, EmbeddedConfig};
use arena_db::backend::pooled::{PooledBackend, PooledConfig};
use arena_db::Backend;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::manager::ManagerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    Embedded,
    Pooled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub backend: BackendSelection,
    /// Used when `backend = embedded`.
    pub embedded_path: PathBuf,
    /// Used when `backend = pooled`. Never logged; only its presence is.
    pub database_url: String,
    pub max_pool_size: u32,
    pub connect_timeout_seconds: u64,
    pub query_timeout_seconds: u64,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: BackendSelection::Embedded,
            embedded_path: PathBuf::from("arena-telemetry.sled"),
            database_url: String::new(),
            max_pool_size: 10,
            connect_timeout_seconds: 5,
            query_timeout_seconds: 30,
            tls_enabled: false,
            tls_cert_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WritesConfig {
    pub batch_size: usize,
    pub max_concurrent_writes: usize,
    pub write_timeout_ms: u64,
    pub batching_enabled: bool,
}

impl Default for WritesConfig {
    fn default() -> Self {
        WritesConfig {
            batch_size: 100,
            max_concurrent_writes: 4,
            write_timeout_ms: 5000,
            batching_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    pub max_game_age_days: Option<i64>,
    pub max_games_per_player: Option<i64>,
    pub auto_cleanup_enabled: bool,
    pub cleanup_interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            max_game_age_days: None,
            max_games_per_player: None,
            auto_cleanup_enabled: false,
            cleanup_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub retention_days: u64,
    pub path: PathBuf,
    pub compression: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            enabled: false,
            interval_hours: 24,
            retention_days: 30,
            path: PathBuf::from("backups"),
            compression: true,
        }
    }
}

/// Default ELO rating, K-factor, and cache/orphan lifetimes, promoted to
/// configuration per spec §9's Open Question ("Default ELO and K-factor are
/// hard-coded... consider making them configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    pub default_elo_rating: f64,
    pub k_factor: f64,
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: u64,
    pub orphan_rethink_ttl_seconds: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            default_elo_rating: 1200.0,
            k_factor: 32.0,
            cache_max_entries: 10_000,
            cache_ttl_seconds: 300,
            orphan_rethink_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArenaConfig {
    pub database: DatabaseConfig,
    pub writes: WritesConfig,
    pub retention: RetentionConfig,
    pub backup: BackupConfig,
    pub collector: CollectorConfig,
    pub stats: StatsConfig,
}

impl ArenaConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Arena.toml"))
            .merge(Env::prefixed("ARENA_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            elo: arena_stats::EloConfig {
                default_rating: self.stats.default_elo_rating,
                k_factor: self.stats.k_factor,
            },
            stats_cache_ttl: Duration::from_secs(self.stats.cache_ttl_seconds),
            orphan_rethink_ttl: Duration::from_secs(self.stats.orphan_rethink_ttl_seconds),
        }
    }

    /// Builds the configured backend, per spec §4.1/§9's "selection is a
    /// construction-time decision".
    pub fn build_backend(&self) -> Arc<dyn Backend> {
        match self.database.backend {
            BackendSelection::Embedded => Arc::new(EmbeddedBackend::new(EmbeddedConfig {
                path: self.database.embedded_path.clone(),
            })),
            BackendSelection::Pooled => Arc::new(PooledBackend::new(PooledConfig {
                database_url: self.database.database_url.clone(),
                max_pool_size: self.database.max_pool_size,
                connect_timeout: Duration::from_secs(self.database.connect_timeout_seconds),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_the_embedded_backend() {
        let config = ArenaConfig::default();
        assert_eq!(config.database.backend, BackendSelection::Embedded);
        assert!(config.collector.enabled);
    }
}
