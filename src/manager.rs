//! The storage manager: the single entry point for writes and most reads,
//! per spec §4.2. Composes a [`Backend`] with validation, transaction
//! discipline (tracked active-transaction ids, diagnostics only), and
//! derived-aggregate orchestration against `arena-stats`.
//!
//! Grounded on the teacher's `mmoldb_db::db` free-function module, reshaped
//! into a struct that owns its backend and cache rather than taking a
//! `&mut PgConnection` per call (there are two backend shapes here, not one
//! connection type).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arena_collector::EventHandler;
use arena_db::{
    Backend, Game, GameFilters, GameOutcome, GameResult, GameUpdate, Move, MoveFilters,
    Pagination, PlayerIndex, PlayerInfo, PlayerStats, RethinkAttempt, StorageError,
    StorageErrorKind, StorageResult, StorageStats,
};
use arena_stats::cache::cache_key;
use arena_stats::elo::{self, EloConfig, Score};
use arena_stats::engine::{
    compute_player_statistics, head_to_head as engine_head_to_head,
    performance_trends as engine_performance_trends, LeaderboardSortBy, PlayerStatistics,
};
use arena_stats::{batch, leaderboard as engine_leaderboard, DailyTrend, HeadToHead, LeaderboardEntry, StatsCache};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Elo defaults and cache/orphan lifetimes, per SPEC_FULL.md's disposition of
/// the "default ELO and K-factor" open question: promoted to configuration
/// rather than hard-coded.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub elo: EloConfig,
    pub stats_cache_ttl: Duration,
    /// How long an out-of-order rethink attempt is buffered waiting for its
    /// parent move, per spec §9's orphan-rethink open question (disposition:
    /// buffer in memory with a bounded TTL).
    pub orphan_rethink_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            elo: EloConfig::default(),
            stats_cache_ttl: Duration::from_secs(300),
            orphan_rethink_ttl: Duration::from_secs(300),
        }
    }
}

struct OrphanRethink {
    attempt: RethinkAttempt,
    expires_at: Instant,
}

struct Inner {
    backend: Arc<dyn Backend>,
    cache: Arc<StatsCache>,
    config: ManagerConfig,
    orphans: StdMutex<HashMap<(String, i32, i16), OrphanRethink>>,
    active_transactions: StdMutex<HashSet<u64>>,
    next_transaction_id: AtomicU64,
}

/// Cheap to clone: an `Arc<Inner>` handle, the same sharing pattern the
/// collector uses for its own state.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<Inner>,
}

struct TransactionGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.inner.active_transactions.lock().unwrap().remove(&self.id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveIntegrityCounts {
    pub total_moves: usize,
    pub legal_moves: usize,
    pub illegal_moves: usize,
    pub moves_with_rethink: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveIntegrityReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub counts: MoveIntegrityCounts,
}

/// Per-game move-accuracy rollup, supplementing spec §4.2's structural
/// `validate-move-integrity` with the accuracy metrics `manager.py`'s
/// `get_move_statistics` exposes, per SPEC_FULL.md §2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveStatistics {
    pub total_moves: usize,
    pub legal_moves: usize,
    pub illegal_moves: usize,
    pub parsing_failures: usize,
    pub rethink_count: usize,
    pub blunders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub storage: StorageStats,
    pub cache_entries: usize,
    pub active_transactions: usize,
    pub orphaned_moves: i64,
    pub collector: Option<arena_collector::CollectorSnapshot>,
}

impl StorageManager {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<StatsCache>, config: ManagerConfig) -> Self {
        StorageManager {
            inner: Arc::new(Inner {
                backend,
                cache,
                config,
                orphans: StdMutex::new(HashMap::new()),
                active_transactions: StdMutex::new(HashSet::new()),
                next_transaction_id: AtomicU64::new(1),
            }),
        }
    }

    pub async fn connect(&self) -> StorageResult<()> {
        self.inner.backend.connect().await?;
        self.inner.backend.initialize_schema().await
    }

    pub fn active_transaction_count(&self) -> usize {
        self.inner.active_transactions.lock().unwrap().len()
    }

    /// Waits briefly for in-flight transactions to finish before closing the
    /// backend, per spec §4.2's "shutdown waits briefly for in-flight
    /// transactions before closing the backend".
    pub async fn shutdown(&self, wait: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline && self.active_transaction_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.inner.backend.disconnect().await
    }

    fn begin_transaction(&self) -> TransactionGuard {
        let id = self.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active_transactions.lock().unwrap().insert(id);
        TransactionGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    fn invalidate_player(&self, player_id: &str) {
        self.inner.cache.invalidate(&format!("player:{player_id}"));
    }

    fn invalidate_leaderboard(&self) {
        self.inner.cache.invalidate("leaderboard");
    }

    // --- Game ops --------------------------------------------------------

    pub async fn create_game(&self, game: Game) -> StorageResult<String> {
        game.validate()?;
        if self.inner.backend.get_game(&game.game_id).await?.is_some() {
            return Err(StorageError::Duplicate(game.game_id.clone()));
        }
        self.inner.backend.create_game(&game).await
    }

    pub async fn get_game(&self, game_id: &str) -> StorageResult<Game> {
        self.inner
            .backend
            .get_game(game_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(game_id.to_string()))
    }

    pub async fn update_game(&self, game_id: &str, update: GameUpdate) -> StorageResult<bool> {
        if let Some(outcome) = &update.outcome {
            outcome.validate()?;
        }
        if let Some(total_moves) = update.total_moves {
            if total_moves < 0 {
                return Err(StorageError::Validation("total_moves must be non-negative".into()));
            }
        }
        if let Some(end_time) = update.end_time {
            let game = self.get_game(game_id).await?;
            if end_time < game.start_time {
                return Err(StorageError::Validation("end_time must be >= start_time".into()));
            }
        }
        self.inner.backend.update_game(game_id, &update).await
    }

    /// The only compound write, per spec §4.2: patches the game, then
    /// best-effort recomputes each participant's stats and ELO. A failure in
    /// the follow-up never rolls back the committed game completion.
    pub async fn complete_game(
        &self,
        game_id: &str,
        outcome: GameOutcome,
        final_fen: String,
        total_moves: i32,
    ) -> StorageResult<bool> {
        outcome.validate()?;
        let _tx = self.begin_transaction();

        let game = self.get_game(game_id).await?;
        let end_time = Utc::now();
        let duration_seconds = (end_time - game.start_time).num_milliseconds() as f64 / 1000.0;

        let update = GameUpdate {
            end_time: Some(end_time),
            outcome: Some(outcome),
            final_fen: Some(final_fen),
            total_moves: Some(total_moves),
            duration_seconds: Some(duration_seconds),
        };
        let updated = self.inner.backend.update_game(game_id, &update).await?;
        drop(_tx);

        let game = self.get_game(game_id).await?;
        for position in [PlayerIndex::BLACK, PlayerIndex::WHITE] {
            let Some(info) = game.player(position) else {
                continue;
            };
            if let Err(e) = self.calculate_and_update_player_stats(&info.player_id).await {
                log::warn!("stats recompute failed for {}: {e}", info.player_id);
            }
        }
        if let Err(e) = self.update_elo_ratings(game_id).await {
            log::warn!("elo update failed for game {game_id}: {e}");
        }

        Ok(updated)
    }

    pub async fn delete_game(&self, game_id: &str) -> StorageResult<bool> {
        self.inner.backend.delete_game(game_id).await
    }

    // --- Move ops ----------------------------------------------------------

    pub async fn add_move(&self, mv: Move) -> StorageResult<i64> {
        mv.validate()?;
        let id = self.inner.backend.insert_move(&mv).await?;
        self.flush_orphan_rethink(&mv.game_id, mv.move_number, mv.player.0).await;
        Ok(id)
    }

    /// Runs within one logical transaction per spec §4.2; a single bad move
    /// is skipped and counted rather than failing the whole batch.
    pub async fn add_moves_batch(&self, moves: Vec<Move>) -> StorageResult<usize> {
        let _tx = self.begin_transaction();
        let mut success = 0usize;
        for mv in moves {
            match self.add_move(mv).await {
                Ok(_) => success += 1,
                Err(e) => log::warn!("skipping invalid move in batch: {e}"),
            }
        }
        Ok(success)
    }

    pub async fn get_moves(&self, game_id: &str, limit: Option<i64>) -> StorageResult<Vec<Move>> {
        self.inner.backend.list_moves(game_id, limit).await
    }

    pub async fn get_move(&self, game_id: &str, move_number: i32, player: i16) -> StorageResult<Move> {
        self.inner
            .backend
            .get_move(game_id, move_number, player)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{game_id}/{move_number}/{player}")))
    }

    pub async fn get_moves_with_filters(
        &self,
        game_id: &str,
        filters: &MoveFilters,
    ) -> StorageResult<Vec<Move>> {
        self.inner.backend.list_moves_with_filters(game_id, filters).await
    }

    /// If the parent move already exists, appends immediately; otherwise
    /// buffers the attempt in memory until the move arrives or the TTL
    /// expires, per spec §9's orphan-rethink disposition.
    pub async fn add_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: RethinkAttempt,
    ) -> StorageResult<()> {
        attempt.validate()?;
        self.purge_expired_orphans();

        if self.inner.backend.get_move(game_id, move_number, player).await?.is_some() {
            self.inner
                .backend
                .append_rethink_attempt(game_id, move_number, player, &attempt)
                .await?;
            return Ok(());
        }

        self.inner.orphans.lock().unwrap().insert(
            (game_id.to_string(), move_number, player),
            OrphanRethink {
                attempt,
                expires_at: Instant::now() + self.inner.config.orphan_rethink_ttl,
            },
        );
        Ok(())
    }

    fn purge_expired_orphans(&self) {
        let now = Instant::now();
        self.inner.orphans.lock().unwrap().retain(|_, o| o.expires_at > now);
    }

    async fn flush_orphan_rethink(&self, game_id: &str, move_number: i32, player: i16) {
        self.purge_expired_orphans();
        let pending = self
            .inner
            .orphans
            .lock()
            .unwrap()
            .remove(&(game_id.to_string(), move_number, player));
        if let Some(orphan) = pending {
            if let Err(e) = self
                .inner
                .backend
                .append_rethink_attempt(game_id, move_number, player, &orphan.attempt)
                .await
            {
                log::warn!("failed to flush buffered rethink attempt for {game_id}/{move_number}/{player}: {e}");
            }
        }
    }

    /// Checks move numbering (gap-free), ply alternation starting from White,
    /// and FEN/notation completeness, per spec §4.2.
    pub async fn validate_move_integrity(&self, game_id: &str) -> StorageResult<MoveIntegrityReport> {
        let moves = self.inner.backend.list_moves(game_id, None).await?;
        let mut errors = Vec::new();
        let warnings = Vec::new();

        let mut numbers: Vec<i32> = moves.iter().map(|m| m.move_number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        for (i, number) in numbers.iter().enumerate() {
            let expected = i as i32 + 1;
            if *number != expected {
                errors.push(format!("move numbers are not gap-free: expected {expected}, found {number}"));
                break;
            }
        }

        let mut chronological = moves.clone();
        chronological.sort_by_key(|m| m.timestamp);
        let mut expected_player = PlayerIndex::WHITE;
        for mv in &chronological {
            if mv.player != expected_player {
                errors.push(format!(
                    "move {} expected player {:?}, found {:?}",
                    mv.move_number, expected_player, mv.player
                ));
            }
            expected_player = expected_player.opponent();
        }

        let mut legal_moves = 0usize;
        let mut illegal_moves = 0usize;
        let mut moves_with_rethink = 0usize;
        for mv in &moves {
            if mv.is_legal {
                legal_moves += 1;
            } else {
                illegal_moves += 1;
            }
            if mv.had_rethink() {
                moves_with_rethink += 1;
            }
            if mv.fen_before.is_empty() || mv.fen_after.is_empty() {
                errors.push(format!("move {} missing a FEN", mv.move_number));
            }
            if mv.move_san.is_empty() || mv.move_uci.is_empty() {
                errors.push(format!("move {} missing notation", mv.move_number));
            }
            if let Err(e) = arena_db::validate_rethink_sequence(&mv.rethink_attempts) {
                errors.push(format!("move {} rethink sequence invalid: {e}", mv.move_number));
            }
        }

        Ok(MoveIntegrityReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            counts: MoveIntegrityCounts {
                total_moves: moves.len(),
                legal_moves,
                illegal_moves,
                moves_with_rethink,
            },
        })
    }

    /// Per-game move-accuracy rollup (SPEC_FULL.md §2's `get_move_statistics`).
    pub async fn get_move_statistics(&self, game_id: &str) -> StorageResult<MoveStatistics> {
        let moves = self.inner.backend.list_moves(game_id, None).await?;
        let mut legal_moves = 0usize;
        let mut illegal_moves = 0usize;
        let mut parsing_failures = 0usize;
        let mut rethink_count = 0usize;
        let mut blunders = 0usize;
        for mv in &moves {
            if mv.is_legal {
                legal_moves += 1;
            } else {
                illegal_moves += 1;
            }
            if !mv.parsing_success {
                parsing_failures += 1;
            }
            rethink_count += mv.rethink_attempts.len();
            if mv.blunder_flag {
                blunders += 1;
            }
        }
        Ok(MoveStatistics {
            total_moves: moves.len(),
            legal_moves,
            illegal_moves,
            parsing_failures,
            rethink_count,
            blunders,
        })
    }

    // --- Query ops -----------------------------------------------------

    pub async fn query_games(&self, filters: &GameFilters, pagination: Pagination) -> StorageResult<Vec<Game>> {
        self.inner.backend.query_games(filters, pagination).await
    }

    pub async fn count_games(&self, filters: &GameFilters) -> StorageResult<i64> {
        self.inner.backend.count_games(filters).await
    }

    async fn games_for_player(&self, player_id: &str) -> StorageResult<Vec<Game>> {
        let filters = GameFilters {
            player_id: Some(player_id.to_string()),
            ..Default::default()
        };
        self.inner.backend.query_games(&filters, Pagination::default()).await
    }

    async fn all_games(&self) -> StorageResult<Vec<Game>> {
        self.inner
            .backend
            .query_games(&GameFilters::default(), Pagination::default())
            .await
    }

    // --- Player stats ops ------------------------------------------------

    pub async fn update_player_stats(&self, stats: PlayerStats) -> StorageResult<()> {
        stats.validate()?;
        self.inner.backend.upsert_player_stats(&stats).await?;
        self.invalidate_player(&stats.player_id);
        self.invalidate_leaderboard();
        Ok(())
    }

    /// Returns the stored stats, creating a default record (ELO at the
    /// configured default) the first time a player is referenced, per spec
    /// §3's "PlayerStats are created on demand" lifecycle note.
    pub async fn get_player_stats(&self, player_id: &str) -> StorageResult<PlayerStats> {
        let key = cache_key("player_stats", &[&player_id]);
        if let Some(cached) = self.inner.cache.get::<PlayerStats>(&key) {
            return Ok(cached);
        }
        let stats = match self.inner.backend.get_player_stats(player_id).await? {
            Some(stats) => stats,
            None => {
                let stats = PlayerStats::new(player_id, self.inner.config.elo.default_rating);
                self.inner.backend.upsert_player_stats(&stats).await?;
                stats
            }
        };
        self.inner.cache.put(
            key,
            self.inner.config.stats_cache_ttl,
            vec![format!("player:{player_id}")],
            &stats,
        );
        Ok(stats)
    }

    async fn move_aggregates_for_player(
        &self,
        player_id: &str,
        games: &[Game],
    ) -> StorageResult<(f64, f64)> {
        let mut total = 0i64;
        let mut illegal = 0i64;
        let mut thinking_sum = 0i64;
        for game in games {
            let position = if game.players.get(&0).map(|p| p.player_id.as_str()) == Some(player_id) {
                Some(PlayerIndex::BLACK)
            } else if game.players.get(&1).map(|p| p.player_id.as_str()) == Some(player_id) {
                Some(PlayerIndex::WHITE)
            } else {
                None
            };
            let Some(position) = position else { continue };
            for mv in self.inner.backend.list_moves(&game.game_id, None).await? {
                if mv.player != position {
                    continue;
                }
                total += 1;
                if !mv.is_legal {
                    illegal += 1;
                }
                thinking_sum += mv.thinking_time_ms;
            }
        }
        if total == 0 {
            return Ok((0.0, 0.0));
        }
        Ok((illegal as f64 / total as f64, thinking_sum as f64 / total as f64))
    }

    /// Recomputes a player's statistics from scratch over every game that
    /// mentions them, per spec §4.4 steps 1-9, and persists the result.
    ///
    /// The ELO trajectory `compute_player_statistics` derives is used for
    /// reporting (peak, history) only; the persisted `elo_rating` carries
    /// over the player's existing stored rating (default 1200 when absent)
    /// unchanged. `update_elo_ratings` is the sole mutator of the persisted
    /// rating, applied once per completed game — recomputing it here too
    /// would double-apply the same game's ELO delta.
    pub async fn calculate_and_update_player_stats(&self, player_id: &str) -> StorageResult<PlayerStats> {
        let games = self.games_for_player(player_id).await?;
        let computed = compute_player_statistics(player_id, &games, &self.inner.config.elo);
        let (illegal_move_rate, average_thinking_time_ms) =
            self.move_aggregates_for_player(player_id, &games).await?;

        let current_elo = self
            .inner
            .backend
            .get_player_stats(player_id)
            .await?
            .map(|s| s.elo_rating)
            .unwrap_or(self.inner.config.elo.default_rating);

        let stats = PlayerStats {
            player_id: player_id.to_string(),
            games_played: computed.completed_games as i32,
            wins: computed.wins as i32,
            losses: computed.losses as i32,
            draws: computed.draws as i32,
            illegal_move_rate,
            average_thinking_time_ms,
            elo_rating: current_elo,
            last_updated: Utc::now(),
        };
        stats.validate()?;
        self.inner.backend.upsert_player_stats(&stats).await?;
        self.invalidate_player(player_id);
        self.invalidate_leaderboard();
        Ok(stats)
    }

    /// Applies a single pairwise ELO update for one completed game and
    /// persists the new ratings, per spec §4.4's ELO update formula.
    pub async fn update_elo_ratings(&self, game_id: &str) -> StorageResult<(f64, f64)> {
        let game = self.get_game(game_id).await?;
        let outcome = game
            .outcome
            .clone()
            .ok_or_else(|| StorageError::Validation("game has no outcome".into()))?;
        if outcome.result == GameResult::Ongoing {
            return Err(StorageError::Validation("game has not completed".into()));
        }
        let black = game
            .player(PlayerIndex::BLACK)
            .ok_or_else(|| StorageError::Validation("game is missing black player".into()))?;
        let white = game
            .player(PlayerIndex::WHITE)
            .ok_or_else(|| StorageError::Validation("game is missing white player".into()))?;

        let black_rating = self.get_player_stats(&black.player_id).await?.elo_rating;
        let white_rating = self.get_player_stats(&white.player_id).await?.elo_rating;
        let black_score = match outcome.result {
            GameResult::Draw => Score::Draw,
            GameResult::BlackWins => Score::Win,
            GameResult::WhiteWins => Score::Loss,
            GameResult::Ongoing => unreachable!("checked above"),
        };
        let (new_black, new_white) =
            elo::update_pair(black_rating, white_rating, black_score, &self.inner.config.elo);

        for (player_id, new_rating) in [(&black.player_id, new_black), (&white.player_id, new_white)] {
            let mut stats = self
                .inner
                .backend
                .get_player_stats(player_id)
                .await?
                .unwrap_or_else(|| PlayerStats::new(player_id.clone(), self.inner.config.elo.default_rating));
            stats.elo_rating = new_rating;
            stats.last_updated = Utc::now();
            self.inner.backend.upsert_player_stats(&stats).await?;
            self.invalidate_player(player_id);
        }
        self.invalidate_leaderboard();
        Ok((new_black, new_white))
    }

    pub async fn head_to_head(&self, player_one: &str, player_two: &str) -> StorageResult<HeadToHead> {
        let filters = GameFilters {
            players: Some(vec![player_one.to_string(), player_two.to_string()]),
            ..Default::default()
        };
        let games = self.inner.backend.query_games(&filters, Pagination::default()).await?;
        Ok(engine_head_to_head(player_one, player_two, &games))
    }

    pub async fn performance_trends(&self, player_id: &str, days: i64) -> StorageResult<Vec<DailyTrend>> {
        let games = self.games_for_player(player_id).await?;
        Ok(engine_performance_trends(player_id, &games, days, Utc::now()))
    }

    pub async fn leaderboard(
        &self,
        sort_by: LeaderboardSortBy,
        min_games: usize,
        limit: usize,
    ) -> StorageResult<Vec<LeaderboardEntry>> {
        let key = cache_key("leaderboard", &[&format!("{sort_by:?}"), &min_games, &limit]);
        if let Some(cached) = self.inner.cache.get::<Vec<LeaderboardEntry>>(&key) {
            return Ok(cached);
        }
        let games = self.all_games().await?;
        let player_ids = distinct_player_ids(&games);
        let stats: Vec<PlayerStatistics> = player_ids
            .iter()
            .map(|id| compute_player_statistics(id, &games, &self.inner.config.elo))
            .collect();
        let entries = engine_leaderboard(&stats, sort_by, min_games, limit);
        self.inner
            .cache
            .put(key, self.inner.config.stats_cache_ttl, vec!["leaderboard".to_string()], &entries);
        Ok(entries)
    }

    /// Parallelizes per-player recomputation across worker threads via
    /// `arena_stats::batch`, per spec §4.4's "Batch recomputation".
    pub async fn update_all_player_stats(&self) -> StorageResult<batch::BatchResult> {
        let games = self.all_games().await?;
        let player_ids = distinct_player_ids(&games);
        let manager = self.clone();
        let handle = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            batch::recompute_many(&player_ids, |player_id| {
                handle.block_on(manager.calculate_and_update_player_stats(player_id))
            })
        })
        .await
        .map_err(StorageError::backend)
    }

    /// Moves whose `game_id` has no corresponding game row, computed against
    /// the backend rather than left as a placeholder.
    pub async fn count_orphaned_moves(&self) -> StorageResult<i64> {
        self.inner.backend.count_orphaned_moves().await
    }

    /// Composes backend connectivity/size, cache occupancy, orphaned-move
    /// count, and an optional collector snapshot into one report, per
    /// SPEC_FULL.md §2's `get_health_status`.
    pub async fn get_health_status(
        &self,
        collector: Option<arena_collector::CollectorSnapshot>,
    ) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            connected: self.inner.backend.is_connected().await,
            storage: self.inner.backend.storage_stats().await?,
            cache_entries: self.inner.cache.len(),
            active_transactions: self.active_transaction_count(),
            orphaned_moves: self.count_orphaned_moves().await?,
            collector,
        })
    }
}

fn distinct_player_ids(games: &[Game]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for game in games {
        for info in game.players.values() {
            if seen.insert(info.player_id.clone()) {
                ids.push(info.player_id.clone());
            }
        }
    }
    ids
}

fn required_str(fields: &BTreeMap<String, Json>, key: &str) -> StorageResult<String> {
    fields
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| StorageError::Validation(format!("missing required field: {key}")))
}

fn required_i64(fields: &BTreeMap<String, Json>, key: &str) -> StorageResult<i64> {
    fields
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| StorageError::Validation(format!("missing required field: {key}")))
}

fn required_bool(fields: &BTreeMap<String, Json>, key: &str) -> StorageResult<bool> {
    fields
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| StorageError::Validation(format!("missing required field: {key}")))
}

/// Builds a `Move` from the collector's closed field map, per spec §4.3's
/// MoveMade handler: "required-field validation (move_number, player,
/// fen_before, fen_after, move_san, move_uci, is_legal, prompt_text,
/// raw_response)".
fn build_move(game_id: &str, timestamp: DateTime<Utc>, fields: &BTreeMap<String, Json>) -> StorageResult<Move> {
    let move_number = required_i64(fields, "move_number")? as i32;
    let player = required_i64(fields, "player")? as i16;
    let is_legal = required_bool(fields, "is_legal")?;

    Ok(Move {
        game_id: game_id.to_string(),
        move_number,
        player: PlayerIndex(player),
        timestamp,
        fen_before: required_str(fields, "fen_before")?,
        fen_after: required_str(fields, "fen_after")?,
        legal_moves: fields
            .get("legal_moves")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        move_san: required_str(fields, "move_san")?,
        move_uci: required_str(fields, "move_uci")?,
        is_legal,
        prompt_text: required_str(fields, "prompt_text")?,
        raw_response: required_str(fields, "raw_response")?,
        parsed_move: fields.get("parsed_move").and_then(|v| v.as_str()).map(str::to_string),
        parsing_success: fields.get("parsing_success").and_then(|v| v.as_bool()).unwrap_or(is_legal),
        parsing_attempts: fields.get("parsing_attempts").and_then(|v| v.as_i64()).unwrap_or(1) as i32,
        thinking_time_ms: fields.get("thinking_time_ms").and_then(|v| v.as_i64()).unwrap_or(0),
        api_call_time_ms: fields.get("api_call_time_ms").and_then(|v| v.as_i64()).unwrap_or(0),
        parsing_time_ms: fields.get("parsing_time_ms").and_then(|v| v.as_i64()).unwrap_or(0),
        rethink_attempts: Vec::new(),
        move_quality_score: fields.get("move_quality_score").and_then(|v| v.as_f64()),
        blunder_flag: fields.get("blunder_flag").and_then(|v| v.as_bool()).unwrap_or(false),
        error_kind: fields.get("error_kind").and_then(|v| v.as_str()).map(str::to_string),
        error_message: fields.get("error_message").and_then(|v| v.as_str()).map(str::to_string),
    })
}

#[async_trait]
impl EventHandler for StorageManager {
    async fn create_game(&self, game: Game) -> StorageResult<()> {
        StorageManager::create_game(self, game).await.map(|_| ())
    }

    async fn add_move(&self, game_id: &str, fields: &BTreeMap<String, Json>) -> StorageResult<()> {
        let mv = build_move(game_id, Utc::now(), fields)?;
        StorageManager::add_move(self, mv).await.map(|_| ())
    }

    async fn complete_game(
        &self,
        game_id: &str,
        outcome: GameOutcome,
        final_fen: String,
        total_moves: i32,
    ) -> StorageResult<()> {
        StorageManager::complete_game(self, game_id, outcome, final_fen, total_moves)
            .await
            .map(|_| ())
    }

    async fn add_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: RethinkAttempt,
    ) -> StorageResult<()> {
        StorageManager::add_rethink_attempt(self, game_id, move_number, player, attempt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_db::{AgentType, EmbeddedBackend, EmbeddedConfig, TerminationReason, DEFAULT_INITIAL_FEN};
    use std::collections::BTreeMap as Map;

    async fn manager() -> StorageManager {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(EmbeddedBackend::new(EmbeddedConfig {
            path: dir.into_path(),
        }));
        backend.connect().await.unwrap();
        backend.initialize_schema().await.unwrap();
        StorageManager::new(backend, Arc::new(StatsCache::default()), ManagerConfig::default())
    }

    fn player(id: &str) -> PlayerInfo {
        PlayerInfo {
            player_id: id.to_string(),
            model_name: "m".into(),
            model_provider: "p".into(),
            agent_type: AgentType::ChessLlmAgent,
            agent_config: Map::new(),
            elo_rating: None,
        }
    }

    fn new_game(id: &str, black: &str, white: &str) -> Game {
        let mut players = Map::new();
        players.insert(0, player(black));
        players.insert(1, player(white));
        Game {
            game_id: id.to_string(),
            tournament_id: None,
            start_time: Utc::now(),
            end_time: None,
            players,
            initial_fen: DEFAULT_INITIAL_FEN.to_string(),
            final_fen: None,
            outcome: None,
            total_moves: 0,
            duration_seconds: None,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let manager = manager().await;
        let game = new_game("g1", "black_model", "white_model");
        manager.create_game(game.clone()).await.unwrap();
        let fetched = manager.get_game("g1").await.unwrap();
        assert_eq!(fetched.game_id, "g1");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let manager = manager().await;
        let game = new_game("g1", "black_model", "white_model");
        manager.create_game(game.clone()).await.unwrap();
        let err = manager.create_game(game).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn complete_game_runs_stats_recompute_then_elo_update() {
        // complete_game runs two steps per player: a from-scratch stats
        // recompute (wins/losses/draws/rates, leaving the persisted ELO
        // untouched) followed by a single pairwise ELO update for this game.
        // update_elo_ratings is the only ELO mutator, so for one WhiteWins
        // game from equal 1200 ratings with K=32 the result is the textbook
        // ±16, per spec §8 scenario 2.
        let manager = manager().await;
        manager
            .create_game(new_game("g1", "black_model", "white_model"))
            .await
            .unwrap();
        let outcome = GameOutcome::new(GameResult::WhiteWins, Some(PlayerIndex::WHITE), TerminationReason::Checkmate).unwrap();
        manager
            .complete_game("g1", outcome, "final".into(), 1)
            .await
            .unwrap();

        let white = manager.get_player_stats("white_model").await.unwrap();
        let black = manager.get_player_stats("black_model").await.unwrap();
        assert!((white.elo_rating - 1216.0).abs() < 1e-6);
        assert!((black.elo_rating - 1184.0).abs() < 1e-6);
        assert_eq!(white.wins, 1);
        assert_eq!(black.losses, 1);
    }

    #[tokio::test]
    async fn complete_game_on_missing_game_is_not_found() {
        let manager = manager().await;
        let outcome = GameOutcome::new(GameResult::Draw, None, TerminationReason::Stalemate).unwrap();
        let err = manager
            .complete_game("missing", outcome, "final".into(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn orphan_rethink_attaches_once_move_arrives() {
        let manager = manager().await;
        manager
            .create_game(new_game("g1", "black_model", "white_model"))
            .await
            .unwrap();
        let attempt = RethinkAttempt {
            attempt_number: 1,
            prompt_text: "p".into(),
            raw_response: "r".into(),
            parsed_move: None,
            was_legal: false,
            timestamp: Utc::now(),
        };
        manager.add_rethink_attempt("g1", 1, 1, attempt).await.unwrap();

        let mv = Move {
            game_id: "g1".into(),
            move_number: 1,
            player: PlayerIndex::WHITE,
            timestamp: Utc::now(),
            fen_before: DEFAULT_INITIAL_FEN.to_string(),
            fen_after: "after".into(),
            legal_moves: vec![],
            move_san: "e4".into(),
            move_uci: "e2e4".into(),
            is_legal: true,
            prompt_text: "p".into(),
            raw_response: "r".into(),
            parsed_move: Some("e4".into()),
            parsing_success: true,
            parsing_attempts: 1,
            thinking_time_ms: 10,
            api_call_time_ms: 5,
            parsing_time_ms: 1,
            rethink_attempts: vec![],
            move_quality_score: None,
            blunder_flag: false,
            error_kind: None,
            error_message: None,
        };
        manager.add_move(mv).await.unwrap();

        let stored = manager.get_move("g1", 1, 1).await.unwrap();
        assert_eq!(stored.rethink_attempts.len(), 1);
    }

    #[tokio::test]
    async fn batch_add_moves_skips_bad_move_and_counts_rest() {
        let manager = manager().await;
        manager
            .create_game(new_game("g1", "black_model", "white_model"))
            .await
            .unwrap();
        let good = Move {
            game_id: "g1".into(),
            move_number: 1,
            player: PlayerIndex::WHITE,
            timestamp: Utc::now(),
            fen_before: "a".into(),
            fen_after: "b".into(),
            legal_moves: vec![],
            move_san: "e4".into(),
            move_uci: "e2e4".into(),
            is_legal: true,
            prompt_text: "p".into(),
            raw_response: "r".into(),
            parsed_move: None,
            parsing_success: true,
            parsing_attempts: 1,
            thinking_time_ms: 0,
            api_call_time_ms: 0,
            parsing_time_ms: 0,
            rethink_attempts: vec![],
            move_quality_score: None,
            blunder_flag: false,
            error_kind: None,
            error_message: None,
        };
        let mut bad = good.clone();
        bad.move_number = -1;

        let count = manager.add_moves_batch(vec![good, bad]).await.unwrap();
        assert_eq!(count, 1);
    }
}
