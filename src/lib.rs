//! Durable telemetry and analytics store for an LLM-vs-LLM chess tournament
//! harness: the storage manager (this crate), the event collector
//! (`arena_collector`), the two storage backends and domain model
//! (`arena_db`), and the statistics engine (`arena_stats`).

pub mod config;
pub mod manager;
pub mod monitoring;

pub use config::ArenaConfig;
pub use manager::{
    HealthStatus, ManagerConfig, MoveIntegrityCounts, MoveIntegrityReport, MoveStatistics,
    StorageManager,
};
