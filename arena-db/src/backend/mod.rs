//! The `Backend` trait: the single capability surface the storage manager
//! programs against. Two concrete implementations exist — [`embedded`] for a
//! single-writer development store and [`pooled`] for a connection-pooled
//! production store — selected once at construction time per spec §4.1/§9
//! ("Dynamic dispatch to backends... selection is a construction-time
//! decision").

pub mod embedded;
pub mod migrations;
pub mod pooled;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::filters::{GameFilters, MoveFilters, Pagination};
use crate::models::{Game, Move, PlayerStats, RethinkAttempt};

/// Partial update to a `Game`, the backend-level equivalent of spec §4.1's
/// "partial update by field map". Kept as a struct of `Option`s rather than a
/// `HashMap<String, Json>` so both backends and the storage manager validate
/// against a closed, typed field set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameUpdate {
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Option<crate::models::GameOutcome>,
    pub final_fen: Option<String>,
    pub total_moves: Option<i32>,
    pub duration_seconds: Option<f64>,
}

impl GameUpdate {
    pub fn is_empty(&self) -> bool {
        self.end_time.is_none()
            && self.outcome.is_none()
            && self.final_fen.is_none()
            && self.total_moves.is_none()
            && self.duration_seconds.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendKind {
    Embedded,
    Pooled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub max_size: u32,
    pub in_use: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub backend: BackendKind,
    pub game_count: i64,
    pub move_count: i64,
    pub player_count: i64,
    pub approximate_size_bytes: u64,
    pub pool: Option<PoolInfo>,
}

/// The capability set every storage backend must expose. Every method is
/// fallible with [`crate::error::StorageError`]; `NotConnected` is returned by
/// any op attempted before [`Backend::connect`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self) -> StorageResult<()>;
    async fn disconnect(&self) -> StorageResult<()>;
    async fn is_connected(&self) -> bool;
    async fn initialize_schema(&self) -> StorageResult<()>;

    async fn create_game(&self, game: &Game) -> StorageResult<String>;
    async fn get_game(&self, game_id: &str) -> StorageResult<Option<Game>>;
    async fn update_game(&self, game_id: &str, update: &GameUpdate) -> StorageResult<bool>;
    async fn delete_game(&self, game_id: &str) -> StorageResult<bool>;

    async fn insert_move(&self, mv: &Move) -> StorageResult<i64>;
    async fn list_moves(&self, game_id: &str, limit: Option<i64>) -> StorageResult<Vec<Move>>;
    async fn get_move(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
    ) -> StorageResult<Option<Move>>;
    async fn update_move(&self, mv: &Move) -> StorageResult<bool>;
    async fn append_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: &RethinkAttempt,
    ) -> StorageResult<bool>;

    async fn upsert_player_stats(&self, stats: &PlayerStats) -> StorageResult<()>;
    async fn get_player_stats(&self, player_id: &str) -> StorageResult<Option<PlayerStats>>;

    async fn query_games(
        &self,
        filters: &GameFilters,
        pagination: Pagination,
    ) -> StorageResult<Vec<Game>>;
    async fn count_games(&self, filters: &GameFilters) -> StorageResult<i64>;

    /// Filtered move listing; the closed filter vocabulary is applied
    /// in-process over `list_moves` results by the storage manager, but
    /// backends may override for a pushed-down implementation.
    async fn list_moves_with_filters(
        &self,
        game_id: &str,
        filters: &MoveFilters,
    ) -> StorageResult<Vec<Move>> {
        let moves = self.list_moves(game_id, None).await?;
        Ok(moves.into_iter().filter(|m| filters.matches(m)).collect())
    }

    async fn delete_games_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<i64>;
    async fn storage_stats(&self) -> StorageResult<StorageStats>;

    /// Counts moves whose `game_id` has no corresponding game row, for the
    /// data-quality validator. Moves can arrive before their game record (the
    /// collector doesn't order across event kinds) or survive a game deleted
    /// by something other than `delete_game`; either way this should trend
    /// toward zero as a harness's writes settle.
    async fn count_orphaned_moves(&self) -> StorageResult<i64>;
}
