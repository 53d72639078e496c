//! Single-writer sled-backed store, for local development and tests.
//!
//! sled itself tolerates concurrent writers fine, but the storage manager's
//! "single-writer" development path (spec §4.1/§9) is modeled here with an
//! explicit `tokio::sync::Mutex` around every write op so move/rethink
//! sequencing is always observed in submission order, matching the ordering
//! guarantee the pooled backend gets for free from Postgres's row locks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{StorageError, StorageResult};
use crate::filters::{GameFilters, Pagination};
use crate::models::{Game, Move, PlayerStats, RethinkAttempt};

use super::migrations::{AppliedMigration, KNOWN_MIGRATIONS};
use super::{Backend, BackendKind, GameUpdate, PoolInfo, StorageStats};

#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    pub path: PathBuf,
}

/// Composite key for the `game_id/move_number/player` uniqueness
/// constraint, sled only sorts byte strings so this needs to be built so
/// that lexicographic order tracks move order within a game.
fn move_index_key(game_id: &str, move_number: i32, player: i16) -> Vec<u8> {
    let mut key = Vec::with_capacity(game_id.len() + 1 + 4 + 2);
    key.extend_from_slice(game_id.as_bytes());
    key.push(0); // NUL separator; game_id may not itself contain one.
    key.extend_from_slice(&move_number.to_be_bytes());
    key.extend_from_slice(&player.to_be_bytes());
    key
}

fn move_id_bytes(id: i64) -> [u8; 8] {
    id.to_be_bytes()
}

pub struct EmbeddedBackend {
    config: EmbeddedConfig,
    db: std::sync::OnceLock<sled::Db>,
    write_lock: AsyncMutex<()>,
    next_move_id: AtomicI64,
}

impl EmbeddedBackend {
    pub fn new(config: EmbeddedConfig) -> Self {
        EmbeddedBackend {
            config,
            db: std::sync::OnceLock::new(),
            write_lock: AsyncMutex::new(()),
            next_move_id: AtomicI64::new(1),
        }
    }

    fn db(&self) -> StorageResult<&sled::Db> {
        self.db.get().ok_or(StorageError::NotConnected)
    }

    fn games_tree(&self) -> StorageResult<sled::Tree> {
        self.db()?.open_tree("games").map_err(StorageError::backend)
    }

    fn moves_tree(&self) -> StorageResult<sled::Tree> {
        self.db()?.open_tree("moves").map_err(StorageError::backend)
    }

    fn move_index_tree(&self) -> StorageResult<sled::Tree> {
        self.db()?
            .open_tree("move_index")
            .map_err(StorageError::backend)
    }

    fn player_stats_tree(&self) -> StorageResult<sled::Tree> {
        self.db()?
            .open_tree("player_stats")
            .map_err(StorageError::backend)
    }

    fn migrations_tree(&self) -> StorageResult<sled::Tree> {
        self.db()?
            .open_tree("schema_migrations")
            .map_err(StorageError::backend)
    }

    fn serialize<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(StorageError::backend)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
        rmp_serde::from_slice(bytes).map_err(StorageError::backend)
    }

    fn load_move_by_id(&self, id: i64) -> StorageResult<Option<Move>> {
        let tree = self.moves_tree()?;
        match tree.get(move_id_bytes(id)).map_err(StorageError::backend)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
        }
    }

    fn store_move_at(&self, id: i64, mv: &Move) -> StorageResult<()> {
        let moves = self.moves_tree()?;
        let index = self.move_index_tree()?;
        moves
            .insert(move_id_bytes(id), Self::serialize(mv)?)
            .map_err(StorageError::backend)?;
        index
            .insert(
                move_index_key(&mv.game_id, mv.move_number, mv.player.0),
                &move_id_bytes(id),
            )
            .map_err(StorageError::backend)?;
        Ok(())
    }

    fn find_move_id(&self, game_id: &str, move_number: i32, player: i16) -> StorageResult<Option<i64>> {
        let index = self.move_index_tree()?;
        match index
            .get(move_index_key(game_id, move_number, player))
            .map_err(StorageError::backend)?
        {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Backend(Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "corrupt move index entry",
                    )))
                })?;
                Ok(Some(i64::from_be_bytes(arr)))
            }
        }
    }
}

#[async_trait]
impl Backend for EmbeddedBackend {
    async fn connect(&self) -> StorageResult<()> {
        if self.db.get().is_some() {
            return Ok(());
        }
        let db = sled::open(&self.config.path).map_err(StorageError::backend)?;
        let mut max_id = 0i64;
        if let Ok(tree) = db.open_tree("moves") {
            if let Some(Ok((key, _))) = tree.iter().next_back() {
                if let Ok(arr) = <[u8; 8]>::try_from(key.as_ref()) {
                    max_id = i64::from_be_bytes(arr);
                }
            }
        }
        self.next_move_id.store(max_id + 1, Ordering::SeqCst);
        self.db
            .set(db)
            .map_err(|_| StorageError::Transaction("embedded db already initialized".into()))?;
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        if let Some(db) = self.db.get() {
            db.flush().map_err(StorageError::backend)?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.db.get().is_some()
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let tree = self.migrations_tree()?;
        for (version, name) in KNOWN_MIGRATIONS {
            let key = version.to_be_bytes();
            if tree.get(key).map_err(StorageError::backend)?.is_none() {
                let applied = AppliedMigration {
                    version: *version,
                    name: (*name).to_string(),
                    applied_at: Utc::now(),
                };
                tree.insert(key, Self::serialize(&applied)?)
                    .map_err(StorageError::backend)?;
            }
        }
        Ok(())
    }

    async fn create_game(&self, game: &Game) -> StorageResult<String> {
        game.validate()?;
        let _guard = self.write_lock.lock().await;
        let tree = self.games_tree()?;
        if tree
            .get(game.game_id.as_bytes())
            .map_err(StorageError::backend)?
            .is_some()
        {
            return Err(StorageError::Duplicate(game.game_id.clone()));
        }
        tree.insert(game.game_id.as_bytes(), Self::serialize(game)?)
            .map_err(StorageError::backend)?;
        Ok(game.game_id.clone())
    }

    async fn get_game(&self, game_id: &str) -> StorageResult<Option<Game>> {
        let tree = self.games_tree()?;
        match tree.get(game_id.as_bytes()).map_err(StorageError::backend)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
        }
    }

    async fn update_game(&self, game_id: &str, update: &GameUpdate) -> StorageResult<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        let tree = self.games_tree()?;
        let Some(bytes) = tree.get(game_id.as_bytes()).map_err(StorageError::backend)? else {
            return Ok(false);
        };
        let mut game: Game = Self::deserialize(&bytes)?;
        if let Some(end_time) = update.end_time {
            game.end_time = Some(end_time);
        }
        if let Some(outcome) = &update.outcome {
            outcome.validate()?;
            game.outcome = Some(outcome.clone());
        }
        if let Some(final_fen) = &update.final_fen {
            game.final_fen = Some(final_fen.clone());
        }
        if let Some(total_moves) = update.total_moves {
            game.total_moves = total_moves;
        }
        if let Some(duration) = update.duration_seconds {
            game.duration_seconds = Some(duration);
        }
        game.validate()?;
        tree.insert(game_id.as_bytes(), Self::serialize(&game)?)
            .map_err(StorageError::backend)?;
        Ok(true)
    }

    async fn delete_game(&self, game_id: &str) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        let games = self.games_tree()?;
        let existed = games
            .remove(game_id.as_bytes())
            .map_err(StorageError::backend)?
            .is_some();
        if existed {
            let moves = self.moves_tree()?;
            let index = self.move_index_tree()?;
            let prefix: Vec<u8> = {
                let mut p = game_id.as_bytes().to_vec();
                p.push(0);
                p
            };
            let stale: Vec<_> = index
                .scan_prefix(&prefix)
                .keys()
                .filter_map(Result::ok)
                .collect();
            for key in stale {
                if let Some(id_bytes) = index.remove(&key).map_err(StorageError::backend)? {
                    let _ = moves.remove(id_bytes);
                }
            }
        }
        Ok(existed)
    }

    async fn insert_move(&self, mv: &Move) -> StorageResult<i64> {
        mv.validate()?;
        let _guard = self.write_lock.lock().await;
        if self
            .find_move_id(&mv.game_id, mv.move_number, mv.player.0)?
            .is_some()
        {
            return Err(StorageError::Duplicate(format!(
                "{}#{}#{}",
                mv.game_id, mv.move_number, mv.player
            )));
        }
        let id = self.next_move_id.fetch_add(1, Ordering::SeqCst);
        self.store_move_at(id, mv)?;
        Ok(id)
    }

    async fn list_moves(&self, game_id: &str, limit: Option<i64>) -> StorageResult<Vec<Move>> {
        let index = self.move_index_tree()?;
        let prefix: Vec<u8> = {
            let mut p = game_id.as_bytes().to_vec();
            p.push(0);
            p
        };
        let mut moves = Vec::new();
        for entry in index.scan_prefix(&prefix) {
            let (_, id_bytes) = entry.map_err(StorageError::backend)?;
            let arr: [u8; 8] = id_bytes.as_ref().try_into().map_err(|_| {
                StorageError::Backend(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "corrupt move index entry",
                )))
            })?;
            if let Some(mv) = self.load_move_by_id(i64::from_be_bytes(arr))? {
                moves.push(mv);
            }
            if let Some(limit) = limit {
                if moves.len() as i64 >= limit {
                    break;
                }
            }
        }
        moves.sort_by(|a, b| a.move_number.cmp(&b.move_number).then(a.player.0.cmp(&b.player.0)));
        Ok(moves)
    }

    async fn get_move(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
    ) -> StorageResult<Option<Move>> {
        match self.find_move_id(game_id, move_number, player)? {
            None => Ok(None),
            Some(id) => self.load_move_by_id(id),
        }
    }

    async fn update_move(&self, mv: &Move) -> StorageResult<bool> {
        mv.validate()?;
        let _guard = self.write_lock.lock().await;
        match self.find_move_id(&mv.game_id, mv.move_number, mv.player.0)? {
            None => Ok(false),
            Some(id) => {
                self.store_move_at(id, mv)?;
                Ok(true)
            }
        }
    }

    async fn append_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: &RethinkAttempt,
    ) -> StorageResult<bool> {
        attempt.validate()?;
        let _guard = self.write_lock.lock().await;
        match self.find_move_id(game_id, move_number, player)? {
            None => Ok(false),
            Some(id) => {
                let Some(mut mv) = self.load_move_by_id(id)? else {
                    return Ok(false);
                };
                mv.rethink_attempts.push(attempt.clone());
                crate::models::validate_rethink_sequence(&mv.rethink_attempts)?;
                self.store_move_at(id, &mv)?;
                Ok(true)
            }
        }
    }

    async fn upsert_player_stats(&self, stats: &PlayerStats) -> StorageResult<()> {
        stats.validate()?;
        let _guard = self.write_lock.lock().await;
        let tree = self.player_stats_tree()?;
        tree.insert(stats.player_id.as_bytes(), Self::serialize(stats)?)
            .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get_player_stats(&self, player_id: &str) -> StorageResult<Option<PlayerStats>> {
        let tree = self.player_stats_tree()?;
        match tree
            .get(player_id.as_bytes())
            .map_err(StorageError::backend)?
        {
            None => Ok(None),
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
        }
    }

    async fn query_games(
        &self,
        filters: &GameFilters,
        pagination: Pagination,
    ) -> StorageResult<Vec<Game>> {
        let tree = self.games_tree()?;
        let mut games: Vec<Game> = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry.map_err(StorageError::backend)?;
            let game: Game = Self::deserialize(&bytes)?;
            if game_matches(&game, filters) {
                games.push(game);
            }
        }
        games.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let offset = pagination.offset.unwrap_or(0).max(0) as usize;
        let games: Vec<Game> = games.into_iter().skip(offset).collect();
        Ok(match pagination.limit {
            Some(limit) => games.into_iter().take(limit.max(0) as usize).collect(),
            None => games,
        })
    }

    async fn count_games(&self, filters: &GameFilters) -> StorageResult<i64> {
        let tree = self.games_tree()?;
        let mut count = 0i64;
        for entry in tree.iter() {
            let (_, bytes) = entry.map_err(StorageError::backend)?;
            let game: Game = Self::deserialize(&bytes)?;
            if game_matches(&game, filters) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_games_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<i64> {
        let _guard = self.write_lock.lock().await;
        let tree = self.games_tree()?;
        let mut stale_ids = Vec::new();
        for entry in tree.iter() {
            let (key, bytes) = entry.map_err(StorageError::backend)?;
            let game: Game = Self::deserialize(&bytes)?;
            if game.start_time < cutoff {
                stale_ids.push((key.to_vec(), game.game_id));
            }
        }
        let count = stale_ids.len() as i64;
        for (key, game_id) in stale_ids {
            tree.remove(key).map_err(StorageError::backend)?;
            let index = self.move_index_tree()?;
            let moves = self.moves_tree()?;
            let mut prefix = game_id.as_bytes().to_vec();
            prefix.push(0);
            let stale: Vec<_> = index
                .scan_prefix(&prefix)
                .keys()
                .filter_map(Result::ok)
                .collect();
            for mkey in stale {
                if let Some(id_bytes) = index.remove(&mkey).map_err(StorageError::backend)? {
                    let _ = moves.remove(id_bytes);
                }
            }
        }
        Ok(count)
    }

    async fn storage_stats(&self) -> StorageResult<StorageStats> {
        let db = self.db()?;
        let game_count = self.games_tree()?.len() as i64;
        let move_count = self.moves_tree()?.len() as i64;
        let mut player_ids = std::collections::HashSet::new();
        for entry in self.games_tree()?.iter() {
            let (_, bytes) = entry.map_err(StorageError::backend)?;
            let game: Game = Self::deserialize(&bytes)?;
            for info in game.players.values() {
                player_ids.insert(info.player_id.clone());
            }
        }
        Ok(StorageStats {
            backend: BackendKind::Embedded,
            game_count,
            move_count,
            player_count: player_ids.len() as i64,
            approximate_size_bytes: db.size_on_disk().unwrap_or(0),
            pool: None as Option<PoolInfo>,
        })
    }

    async fn count_orphaned_moves(&self) -> StorageResult<i64> {
        let games = self.games_tree()?;
        let moves = self.moves_tree()?;
        let mut seen_game_ids = std::collections::HashSet::new();
        let mut count = 0i64;
        for entry in moves.iter() {
            let (_, bytes) = entry.map_err(StorageError::backend)?;
            let mv: Move = Self::deserialize(&bytes)?;
            if seen_game_ids.contains(&mv.game_id) {
                continue;
            }
            let exists = games
                .get(mv.game_id.as_bytes())
                .map_err(StorageError::backend)?
                .is_some();
            if exists {
                seen_game_ids.insert(mv.game_id.clone());
            } else {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn game_matches(game: &Game, filters: &GameFilters) -> bool {
    if let Some(tournament_id) = &filters.tournament_id {
        if game.tournament_id.as_deref() != Some(tournament_id.as_str()) {
            return false;
        }
    }
    if let Some(start_date) = filters.start_date {
        if game.start_time < start_date {
            return false;
        }
    }
    if let Some(end_date) = filters.end_date {
        if game.start_time > end_date {
            return false;
        }
    }
    if let Some(result) = filters.outcome_result {
        match &game.outcome {
            Some(outcome) if outcome.result == result => {}
            _ => return false,
        }
    }
    if let Some(player_id) = &filters.player_id {
        if !game.players.values().any(|p| &p.player_id == player_id) {
            return false;
        }
    }
    if let Some(players) = &filters.players {
        for player_id in players {
            if !game.players.values().any(|p| &p.player_id == player_id) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, PlayerInfo};
    use std::collections::BTreeMap;

    fn backend() -> EmbeddedBackend {
        let dir = tempfile::tempdir().unwrap();
        EmbeddedBackend::new(EmbeddedConfig {
            path: dir.into_path(),
        })
    }

    fn sample_move(game_id: &str, move_number: i32, player: crate::models::PlayerIndex) -> Move {
        Move {
            game_id: game_id.to_string(),
            move_number,
            player,
            timestamp: Utc::now(),
            fen_before: "a".into(),
            fen_after: "b".into(),
            legal_moves: vec!["e2e4".into()],
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
        }
    }

    fn player(id: &str) -> PlayerInfo {
        PlayerInfo {
            player_id: id.to_string(),
            model_name: "gpt-test".into(),
            model_provider: "test".into(),
            agent_type: AgentType::ChessLlmAgent,
            agent_config: BTreeMap::new(),
            elo_rating: None,
        }
    }

    fn game(id: &str) -> Game {
        let mut players = BTreeMap::new();
        players.insert(0, player("black"));
        players.insert(1, player("white"));
        Game {
            game_id: id.to_string(),
            tournament_id: None,
            start_time: Utc::now(),
            end_time: None,
            players,
            initial_fen: crate::models::DEFAULT_INITIAL_FEN.to_string(),
            final_fen: None,
            outcome: None,
            total_moves: 0,
            duration_seconds: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        let fetched = backend.get_game("g1").await.unwrap().unwrap();
        assert_eq!(fetched.game_id, "g1");
    }

    #[tokio::test]
    async fn duplicate_game_id_rejected() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        let err = backend.create_game(&game("g1")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::StorageErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn move_uniqueness_enforced_per_game_number_player() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        let mv = sample_move("g1", 1, crate::models::PlayerIndex::WHITE);
        backend.insert_move(&mv).await.unwrap();
        let err = backend.insert_move(&mv).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::StorageErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn list_moves_returns_in_order() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        for n in [3, 1, 2] {
            let mv = sample_move("g1", n, crate::models::PlayerIndex::WHITE);
            backend.insert_move(&mv).await.unwrap();
        }
        let moves = backend.list_moves("g1", None).await.unwrap();
        let numbers: Vec<i32> = moves.iter().map(|m| m.move_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delete_game_cascades_moves() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        let mv = sample_move("g1", 1, crate::models::PlayerIndex::WHITE);
        backend.insert_move(&mv).await.unwrap();
        assert!(backend.delete_game("g1").await.unwrap());
        assert!(backend.list_moves("g1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_game_rejects_outcome_without_end_time() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        let outcome = crate::models::GameOutcome::new(
            crate::models::GameResult::Draw,
            None,
            crate::models::TerminationReason::Stalemate,
        )
        .unwrap();
        let update = GameUpdate {
            outcome: Some(outcome),
            ..Default::default()
        };
        let err = backend.update_game("g1", &update).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::StorageErrorKind::Validation);
    }

    #[tokio::test]
    async fn orphaned_moves_are_counted_not_hardcoded() {
        let backend = backend();
        backend.connect().await.unwrap();
        backend.create_game(&game("g1")).await.unwrap();
        backend
            .insert_move(&sample_move("g1", 1, crate::models::PlayerIndex::WHITE))
            .await
            .unwrap();
        assert_eq!(backend.count_orphaned_moves().await.unwrap(), 0);

        backend
            .insert_move(&sample_move("ghost-game", 1, crate::models::PlayerIndex::WHITE))
            .await
            .unwrap();
        assert_eq!(backend.count_orphaned_moves().await.unwrap(), 1);
    }
}
