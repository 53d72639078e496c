//! The two process-wide singletons named in spec §9's "Global mutable
//! state": the statistics cache and the monitoring metrics aggregator. Both
//! are lazily initialized on first use via `OnceLock` and have an explicit
//! shutdown hook; neither is constructed implicitly anywhere else.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use arena_collector::CollectorSnapshot;
use arena_db::StorageStats;
use arena_stats::StatsCache;
use serde::{Deserialize, Serialize};

static STATS_CACHE: OnceLock<Arc<StatsCache>> = OnceLock::new();

/// Returns the process-wide statistics cache, creating it with
/// `max_entries` the first time it's called. Later calls ignore their
/// `max_entries` argument; the cache is sized once, at first use.
pub fn stats_cache(max_entries: usize) -> Arc<StatsCache> {
    STATS_CACHE
        .get_or_init(|| Arc::new(StatsCache::new(max_entries)))
        .clone()
}

struct Aggregator {
    started_at: Instant,
}

static AGGREGATOR: OnceLock<Aggregator> = OnceLock::new();

fn aggregator() -> &'static Aggregator {
    AGGREGATOR.get_or_init(|| Aggregator {
        started_at: Instant::now(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub uptime_seconds: f64,
    pub storage: StorageStats,
    pub cache_entries: usize,
    pub collector: Option<CollectorSnapshot>,
}

/// Composes backend, cache, and collector state into one report. Mirrors
/// [`crate::manager::StorageManager::get_health_status`] but adds process
/// uptime, since that's aggregator-owned state rather than manager state.
pub fn report(
    storage: StorageStats,
    cache_entries: usize,
    collector: Option<CollectorSnapshot>,
) -> MonitoringReport {
    MonitoringReport {
        uptime_seconds: aggregator().started_at.elapsed().as_secs_f64(),
        storage,
        cache_entries,
        collector,
    }
}

/// Explicit shutdown hook for the aggregator, called once at process exit.
/// The aggregator holds no resources that need releasing; this exists so
/// the lifecycle documented in spec §9 has a concrete call site.
pub fn shutdown() {
    log::info!("monitoring aggregator shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_cache_singleton_is_stable_across_calls() {
        let first = stats_cache(10);
        let second = stats_cache(999);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
