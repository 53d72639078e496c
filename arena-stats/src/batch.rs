//! Batch per-player stats recomputation, per spec §4.4's "Batch
//! recomputation" paragraph and SPEC_FULL.md's `generate_leaderboard_batch`
//! supplement. A performance affordance, not a correctness requirement: a
//! failure for one player never aborts the batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use arena_db::{PlayerStats, StorageResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub player_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<BatchOutcome>,
    pub progress: BatchProgress,
}

/// Recomputes stats for every id in `player_ids` in parallel across rayon's
/// global thread pool, via the caller-supplied `recompute` closure (expected
/// to be `calculate-and-update-player-stats` from the storage manager,
/// typically bridging back into async code with `Handle::block_on`). Absorbs
/// per-player failures into the result rather than aborting the batch.
pub fn recompute_many<F>(player_ids: &[String], recompute: F) -> BatchResult
where
    F: Fn(&str) -> StorageResult<PlayerStats> + Sync,
{
    let started = Instant::now();
    let processed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let outcomes: Vec<BatchOutcome> = player_ids
        .par_iter()
        .map(|player_id| {
            let outcome = match recompute(player_id) {
                Ok(_) => BatchOutcome {
                    player_id: player_id.clone(),
                    success: true,
                    error: None,
                },
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    BatchOutcome {
                        player_id: player_id.clone(),
                        success: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            processed.fetch_add(1, Ordering::Relaxed);
            outcome
        })
        .collect();

    BatchResult {
        outcomes,
        progress: BatchProgress {
            total: player_ids.len(),
            processed: processed.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            elapsed_seconds: started.elapsed().as_secs_f64(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn one_bad_player_does_not_abort_the_batch() {
        let ids = vec!["a".to_string(), "bad".to_string(), "c".to_string()];
        let result = recompute_many(&ids, |id| {
            if id == "bad" {
                Err(arena_db::StorageError::Validation("boom".into()))
            } else {
                Ok(PlayerStats {
                    player_id: id.to_string(),
                    games_played: 0,
                    wins: 0,
                    losses: 0,
                    draws: 0,
                    illegal_move_rate: 0.0,
                    average_thinking_time_ms: 0.0,
                    elo_rating: 1200.0,
                    last_updated: Utc::now(),
                })
            }
        });
        assert_eq!(result.progress.total, 3);
        assert_eq!(result.progress.processed, 3);
        assert_eq!(result.progress.failed, 1);
    }
}
