//! Connection-pooled PostgreSQL backend, for production deployments.
//!
//! Grounded in the teacher's `mmoldb-db::pool`/`mmoldb-db::migrations`: an
//! r2d2-managed `ConnectionManager<PgConnection>`, embedded migrations run
//! under a `pg_advisory_lock` so concurrent launches don't race the schema.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::BigInt;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{info, warn};

use crate::error::{StorageError, StorageResult};
use crate::filters::{GameFilters, Pagination};
use crate::models::{
    Game, GameOutcome, GameResult, Move, PlayerIndex, PlayerInfo, PlayerStats, RethinkAttempt,
    TerminationReason,
};
use crate::schema;

use super::{Backend, BackendKind, GameUpdate, PoolInfo, StorageStats};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const MIGRATION_LOCK_ID: i64 = 844_201;

type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Connection string, pool size, and statement timeout for the pooled
/// backend. `database_url` is never logged; only its presence is.
#[derive(Debug, Clone)]
pub struct PooledConfig {
    pub database_url: String,
    pub max_pool_size: u32,
    pub connect_timeout: Duration,
}

impl Default for PooledConfig {
    fn default() -> Self {
        PooledConfig {
            database_url: String::new(),
            max_pool_size: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PooledBackend {
    config: PooledConfig,
    pool: std::sync::OnceLock<PgPool>,
}

impl PooledBackend {
    pub fn new(config: PooledConfig) -> Self {
        PooledBackend {
            config,
            pool: std::sync::OnceLock::new(),
        }
    }

    fn pool(&self) -> StorageResult<&PgPool> {
        self.pool.get().ok_or(StorageError::NotConnected)
    }

    fn conn(&self) -> StorageResult<PgConn> {
        self.pool()?.get().map_err(StorageError::backend)
    }
}

fn player_to_json(info: &PlayerInfo) -> StorageResult<serde_json::Value> {
    serde_json::to_value(info).map_err(StorageError::backend)
}

fn player_from_json(value: serde_json::Value) -> StorageResult<PlayerInfo> {
    serde_json::from_value(value).map_err(StorageError::backend)
}

fn outcome_to_columns(
    outcome: &Option<GameOutcome>,
) -> (Option<String>, Option<i16>, Option<String>) {
    match outcome {
        None => (None, None, None),
        Some(o) => (
            Some(result_to_str(o.result).to_string()),
            o.winner.map(|w| w.0),
            Some(termination_to_str(o.termination).to_string()),
        ),
    }
}

fn result_to_str(result: GameResult) -> &'static str {
    match result {
        GameResult::WhiteWins => "white_wins",
        GameResult::BlackWins => "black_wins",
        GameResult::Draw => "draw",
        GameResult::Ongoing => "ongoing",
    }
}

fn result_from_str(s: &str) -> StorageResult<GameResult> {
    match s {
        "white_wins" => Ok(GameResult::WhiteWins),
        "black_wins" => Ok(GameResult::BlackWins),
        "draw" => Ok(GameResult::Draw),
        "ongoing" => Ok(GameResult::Ongoing),
        other => Err(StorageError::backend(InvalidEnumValue(format!(
            "outcome_result: {other}"
        )))),
    }
}

fn termination_to_str(reason: TerminationReason) -> &'static str {
    match reason {
        TerminationReason::Checkmate => "checkmate",
        TerminationReason::Stalemate => "stalemate",
        TerminationReason::Resignation => "resignation",
        TerminationReason::Timeout => "timeout",
        TerminationReason::InsufficientMaterial => "insufficient_material",
        TerminationReason::ThreefoldRepetition => "threefold_repetition",
        TerminationReason::FiftyMoveRule => "fifty_move_rule",
        TerminationReason::Error => "error",
    }
}

fn termination_from_str(s: &str) -> StorageResult<TerminationReason> {
    Ok(match s {
        "checkmate" => TerminationReason::Checkmate,
        "stalemate" => TerminationReason::Stalemate,
        "resignation" => TerminationReason::Resignation,
        "timeout" => TerminationReason::Timeout,
        "insufficient_material" => TerminationReason::InsufficientMaterial,
        "threefold_repetition" => TerminationReason::ThreefoldRepetition,
        "fifty_move_rule" => TerminationReason::FiftyMoveRule,
        "error" => TerminationReason::Error,
        other => {
            return Err(StorageError::backend(InvalidEnumValue(format!(
                "outcome_termination: {other}"
            ))))
        }
    })
}

#[derive(Debug)]
struct InvalidEnumValue(String);

impl std::fmt::Display for InvalidEnumValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid stored enum value: {}", self.0)
    }
}
impl std::error::Error for InvalidEnumValue {}

#[derive(Queryable)]
struct GameRow {
    game_id: String,
    tournament_id: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    _black_player_id: String,
    black_player_json: serde_json::Value,
    _white_player_id: String,
    white_player_json: serde_json::Value,
    initial_fen: String,
    final_fen: Option<String>,
    outcome_result: Option<String>,
    outcome_winner: Option<i16>,
    outcome_termination: Option<String>,
    total_moves: i32,
    duration_seconds: Option<f64>,
    metadata: serde_json::Value,
}

impl GameRow {
    fn into_game(self) -> StorageResult<Game> {
        let outcome = match (self.outcome_result, self.outcome_termination) {
            (Some(result), Some(termination)) => Some(GameOutcome {
                result: result_from_str(&result)?,
                winner: self.outcome_winner.map(PlayerIndex),
                termination: termination_from_str(&termination)?,
            }),
            _ => None,
        };
        let mut players = std::collections::BTreeMap::new();
        players.insert(0, player_from_json(self.black_player_json)?);
        players.insert(1, player_from_json(self.white_player_json)?);
        let metadata = match self.metadata {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => std::collections::BTreeMap::new(),
        };
        Ok(Game {
            game_id: self.game_id,
            tournament_id: self.tournament_id,
            start_time: self.start_time,
            end_time: self.end_time,
            players,
            initial_fen: self.initial_fen,
            final_fen: self.final_fen,
            outcome,
            total_moves: self.total_moves,
            duration_seconds: self.duration_seconds,
            metadata,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = schema::games)]
struct NewGameRow<'a> {
    game_id: &'a str,
    tournament_id: Option<&'a str>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    black_player_id: &'a str,
    black_player_json: serde_json::Value,
    white_player_id: &'a str,
    white_player_json: serde_json::Value,
    initial_fen: &'a str,
    final_fen: Option<&'a str>,
    outcome_result: Option<&'a str>,
    outcome_winner: Option<i16>,
    outcome_termination: Option<&'a str>,
    total_moves: i32,
    duration_seconds: Option<f64>,
    metadata: serde_json::Value,
}

#[derive(Queryable)]
struct MoveRow {
    id: i64,
    game_id: String,
    move_number: i32,
    player: i16,
    timestamp: DateTime<Utc>,
    fen_before: String,
    fen_after: String,
    legal_moves: serde_json::Value,
    move_san: String,
    move_uci: String,
    is_legal: bool,
    prompt_text: String,
    raw_response: String,
    parsed_move: Option<String>,
    parsing_success: bool,
    parsing_attempts: i32,
    thinking_time_ms: i64,
    api_call_time_ms: i64,
    parsing_time_ms: i64,
    move_quality_score: Option<f64>,
    blunder_flag: bool,
    error_kind: Option<String>,
    error_message: Option<String>,
}

impl MoveRow {
    fn into_move(self, rethink_attempts: Vec<RethinkAttempt>) -> StorageResult<Move> {
        let legal_moves = match self.legal_moves {
            serde_json::Value::Array(values) => values
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Ok(Move {
            game_id: self.game_id,
            move_number: self.move_number,
            player: PlayerIndex(self.player),
            timestamp: self.timestamp,
            fen_before: self.fen_before,
            fen_after: self.fen_after,
            legal_moves,
            move_san: self.move_san,
            move_uci: self.move_uci,
            is_legal: self.is_legal,
            prompt_text: self.prompt_text,
            raw_response: self.raw_response,
            parsed_move: self.parsed_move,
            parsing_success: self.parsing_success,
            parsing_attempts: self.parsing_attempts,
            thinking_time_ms: self.thinking_time_ms,
            api_call_time_ms: self.api_call_time_ms,
            parsing_time_ms: self.parsing_time_ms,
            rethink_attempts,
            move_quality_score: self.move_quality_score,
            blunder_flag: self.blunder_flag,
            error_kind: self.error_kind,
            error_message: self.error_message,
        })
    }
}

#[derive(Queryable)]
struct RethinkRow {
    attempt_number: i32,
    prompt_text: String,
    raw_response: String,
    parsed_move: Option<String>,
    was_legal: bool,
    timestamp: DateTime<Utc>,
}

impl From<RethinkRow> for RethinkAttempt {
    fn from(row: RethinkRow) -> Self {
        RethinkAttempt {
            attempt_number: row.attempt_number,
            prompt_text: row.prompt_text,
            raw_response: row.raw_response,
            parsed_move: row.parsed_move,
            was_legal: row.was_legal,
            timestamp: row.timestamp,
        }
    }
}

#[derive(Queryable)]
struct PlayerStatsRow {
    player_id: String,
    games_played: i32,
    wins: i32,
    losses: i32,
    draws: i32,
    illegal_move_rate: f64,
    average_thinking_time_ms: f64,
    elo_rating: f64,
    last_updated: DateTime<Utc>,
}

impl From<PlayerStatsRow> for PlayerStats {
    fn from(row: PlayerStatsRow) -> Self {
        PlayerStats {
            player_id: row.player_id,
            games_played: row.games_played,
            wins: row.wins,
            losses: row.losses,
            draws: row.draws,
            illegal_move_rate: row.illegal_move_rate,
            average_thinking_time_ms: row.average_thinking_time_ms,
            elo_rating: row.elo_rating,
            last_updated: row.last_updated,
        }
    }
}

fn ensure_player_row(conn: &mut PgConn, info: &PlayerInfo) -> StorageResult<()> {
    use schema::players::dsl as p;
    diesel::insert_into(schema::players::table)
        .values((
            p::player_id.eq(&info.player_id),
            p::model_name.eq(&info.model_name),
            p::model_provider.eq(&info.model_provider),
        ))
        .on_conflict(p::player_id)
        .do_update()
        .set((
            p::model_name.eq(&info.model_name),
            p::model_provider.eq(&info.model_provider),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

#[async_trait]
impl Backend for PooledBackend {
    async fn connect(&self) -> StorageResult<()> {
        if self.pool.get().is_some() {
            return Ok(());
        }
        let manager = ConnectionManager::<PgConnection>::new(&self.config.database_url);
        let pool = Pool::builder()
            .max_size(self.config.max_pool_size)
            .connection_timeout(self.config.connect_timeout)
            .build(manager)
            .map_err(StorageError::backend)?;
        self.pool
            .set(pool)
            .map_err(|_| StorageError::Transaction("pool already initialized".into()))?;
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        // r2d2 pools release connections back to the OS on drop; nothing to
        // proactively close here. Mirrors the teacher, which never tears
        // down its pool early either.
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.pool.get().is_some()
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        let mut conn = self.conn()?;
        info!("acquiring schema migration lock");
        diesel::sql_query("select pg_advisory_lock($1)")
            .bind::<BigInt, _>(MIGRATION_LOCK_ID)
            .execute(&mut conn)
            .map_err(StorageError::from)?;

        let result = conn.run_pending_migrations(MIGRATIONS).map(|_| ());

        let unlock = diesel::sql_query("select pg_advisory_unlock($1)")
            .bind::<BigInt, _>(MIGRATION_LOCK_ID)
            .execute(&mut conn);
        if let Err(e) = unlock {
            warn!("failed to release schema migration lock cleanly: {e}");
        }

        result.map_err(|e| StorageError::Transaction(e.to_string()))
    }

    async fn create_game(&self, game: &Game) -> StorageResult<String> {
        game.validate()?;
        let mut conn = self.conn()?;
        let black = game.player(PlayerIndex::BLACK).expect("validated");
        let white = game.player(PlayerIndex::WHITE).expect("validated");
        ensure_player_row(&mut conn, black)?;
        ensure_player_row(&mut conn, white)?;

        let (outcome_result, outcome_winner, outcome_termination) =
            outcome_to_columns(&game.outcome);
        let metadata = serde_json::Value::Object(game.metadata.clone().into_iter().collect());

        let row = NewGameRow {
            game_id: &game.game_id,
            tournament_id: game.tournament_id.as_deref(),
            start_time: game.start_time,
            end_time: game.end_time,
            black_player_id: &black.player_id,
            black_player_json: player_to_json(black)?,
            white_player_id: &white.player_id,
            white_player_json: player_to_json(white)?,
            initial_fen: &game.initial_fen,
            final_fen: game.final_fen.as_deref(),
            outcome_result: outcome_result.as_deref(),
            outcome_winner,
            outcome_termination: outcome_termination.as_deref(),
            total_moves: game.total_moves,
            duration_seconds: game.duration_seconds,
            metadata,
        };

        diesel::insert_into(schema::games::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => StorageError::Duplicate(game.game_id.clone()),
                other => StorageError::from(other),
            })?;
        Ok(game.game_id.clone())
    }

    async fn get_game(&self, game_id: &str) -> StorageResult<Option<Game>> {
        use schema::games::dsl as g;
        let mut conn = self.conn()?;
        let row = g::games
            .filter(g::game_id.eq(game_id))
            .select((
                g::game_id,
                g::tournament_id,
                g::start_time,
                g::end_time,
                g::black_player_id,
                g::black_player_json,
                g::white_player_id,
                g::white_player_json,
                g::initial_fen,
                g::final_fen,
                g::outcome_result,
                g::outcome_winner,
                g::outcome_termination,
                g::total_moves,
                g::duration_seconds,
                g::metadata,
            ))
            .first::<GameRow>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(GameRow::into_game).transpose()
    }

    /// Load-patch-validate-write, matching `embedded::update_game`: the
    /// patched game is re-validated as a whole before anything is written,
    /// so a partial update that would leave it invariant-violating (e.g. an
    /// outcome with no end_time, per spec §3) is rejected rather than
    /// silently persisted.
    async fn update_game(&self, game_id: &str, update: &GameUpdate) -> StorageResult<bool> {
        use schema::games::dsl as g;
        if update.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn()?;

        let affected = conn.transaction(|conn| {
            let row = g::games
                .filter(g::game_id.eq(game_id))
                .select((
                    g::game_id,
                    g::tournament_id,
                    g::start_time,
                    g::end_time,
                    g::black_player_id,
                    g::black_player_json,
                    g::white_player_id,
                    g::white_player_json,
                    g::initial_fen,
                    g::final_fen,
                    g::outcome_result,
                    g::outcome_winner,
                    g::outcome_termination,
                    g::total_moves,
                    g::duration_seconds,
                    g::metadata,
                ))
                .first::<GameRow>(conn)
                .optional()?;
            let Some(row) = row else {
                return Ok::<_, StorageError>(0);
            };
            let mut game = row.into_game()?;

            if let Some(end_time) = update.end_time {
                game.end_time = Some(end_time);
            }
            if let Some(outcome) = &update.outcome {
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

            let (outcome_result, outcome_winner, outcome_termination) =
                outcome_to_columns(&game.outcome);
            let affected = diesel::update(g::games.filter(g::game_id.eq(game_id)))
                .set((
                    g::end_time.eq(game.end_time),
                    g::outcome_result.eq(outcome_result.as_deref()),
                    g::outcome_winner.eq(outcome_winner),
                    g::outcome_termination.eq(outcome_termination.as_deref()),
                    g::final_fen.eq(&game.final_fen),
                    g::total_moves.eq(game.total_moves),
                    g::duration_seconds.eq(game.duration_seconds),
                ))
                .execute(conn)?;
            Ok(affected)
        });
        Ok(affected? > 0)
    }

    async fn delete_game(&self, game_id: &str) -> StorageResult<bool> {
        use schema::games::dsl as g;
        let mut conn = self.conn()?;
        let affected = diesel::delete(g::games.filter(g::game_id.eq(game_id)))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected > 0)
    }

    async fn insert_move(&self, mv: &Move) -> StorageResult<i64> {
        mv.validate()?;
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        let legal_moves = serde_json::Value::Array(
            mv.legal_moves
                .iter()
                .map(|s| serde_json::Value::String(s.clone()))
                .collect(),
        );

        let id: i64 = diesel::insert_into(schema::moves::table)
            .values((
                m::game_id.eq(&mv.game_id),
                m::move_number.eq(mv.move_number),
                m::player.eq(mv.player.0),
                m::timestamp.eq(mv.timestamp),
                m::fen_before.eq(&mv.fen_before),
                m::fen_after.eq(&mv.fen_after),
                m::legal_moves.eq(legal_moves),
                m::move_san.eq(&mv.move_san),
                m::move_uci.eq(&mv.move_uci),
                m::is_legal.eq(mv.is_legal),
                m::prompt_text.eq(&mv.prompt_text),
                m::raw_response.eq(&mv.raw_response),
                m::parsed_move.eq(&mv.parsed_move),
                m::parsing_success.eq(mv.parsing_success),
                m::parsing_attempts.eq(mv.parsing_attempts),
                m::thinking_time_ms.eq(mv.thinking_time_ms),
                m::api_call_time_ms.eq(mv.api_call_time_ms),
                m::parsing_time_ms.eq(mv.parsing_time_ms),
                m::move_quality_score.eq(mv.move_quality_score),
                m::blunder_flag.eq(mv.blunder_flag),
                m::error_kind.eq(&mv.error_kind),
                m::error_message.eq(&mv.error_message),
            ))
            .returning(m::id)
            .get_result(&mut conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => StorageError::Duplicate(format!(
                    "{}#{}#{}",
                    mv.game_id, mv.move_number, mv.player
                )),
                other => StorageError::from(other),
            })?;

        for attempt in &mv.rethink_attempts {
            insert_rethink_row(&mut conn, id, attempt)?;
        }
        Ok(id)
    }

    async fn list_moves(&self, game_id: &str, limit: Option<i64>) -> StorageResult<Vec<Move>> {
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        let mut query = m::moves
            .filter(m::game_id.eq(game_id))
            .order(m::move_number.asc())
            .into_boxed();
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let rows: Vec<MoveRow> = query
            .select((
                m::id,
                m::game_id,
                m::move_number,
                m::player,
                m::timestamp,
                m::fen_before,
                m::fen_after,
                m::legal_moves,
                m::move_san,
                m::move_uci,
                m::is_legal,
                m::prompt_text,
                m::raw_response,
                m::parsed_move,
                m::parsing_success,
                m::parsing_attempts,
                m::thinking_time_ms,
                m::api_call_time_ms,
                m::parsing_time_ms,
                m::move_quality_score,
                m::blunder_flag,
                m::error_kind,
                m::error_message,
            ))
            .load(&mut conn)
            .map_err(StorageError::from)?;

        let mut moves = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let rethinks = load_rethink_rows(&mut conn, id)?;
            moves.push(row.into_move(rethinks)?);
        }
        Ok(moves)
    }

    async fn get_move(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
    ) -> StorageResult<Option<Move>> {
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        let row: Option<MoveRow> = m::moves
            .filter(m::game_id.eq(game_id))
            .filter(m::move_number.eq(move_number))
            .filter(m::player.eq(player))
            .select((
                m::id,
                m::game_id,
                m::move_number,
                m::player,
                m::timestamp,
                m::fen_before,
                m::fen_after,
                m::legal_moves,
                m::move_san,
                m::move_uci,
                m::is_legal,
                m::prompt_text,
                m::raw_response,
                m::parsed_move,
                m::parsing_success,
                m::parsing_attempts,
                m::thinking_time_ms,
                m::api_call_time_ms,
                m::parsing_time_ms,
                m::move_quality_score,
                m::blunder_flag,
                m::error_kind,
                m::error_message,
            ))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let id = row.id;
                let rethinks = load_rethink_rows(&mut conn, id)?;
                Ok(Some(row.into_move(rethinks)?))
            }
        }
    }

    /// Updates a move's mutable scalar fields and, per the backend contract,
    /// replaces its rethink attempts atomically with whatever list `mv`
    /// carries — the normalized-table equivalent of `embedded`'s whole-value
    /// overwrite, done as one transaction so readers never see a move with a
    /// stale or half-replaced rethink list.
    async fn update_move(&self, mv: &Move) -> StorageResult<bool> {
        mv.validate()?;
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        let attempts = mv.rethink_attempts.clone();
        let affected = conn.transaction(|conn| {
            let move_id: Option<i64> = m::moves
                .filter(m::game_id.eq(&mv.game_id))
                .filter(m::move_number.eq(mv.move_number))
                .filter(m::player.eq(mv.player.0))
                .select(m::id)
                .first(conn)
                .optional()?;
            let Some(move_id) = move_id else {
                return Ok::<_, diesel::result::Error>(0);
            };
            let affected = diesel::update(m::moves.filter(m::id.eq(move_id)))
                .set((
                    m::is_legal.eq(mv.is_legal),
                    m::parsed_move.eq(&mv.parsed_move),
                    m::parsing_success.eq(mv.parsing_success),
                    m::parsing_attempts.eq(mv.parsing_attempts),
                    m::move_quality_score.eq(mv.move_quality_score),
                    m::blunder_flag.eq(mv.blunder_flag),
                    m::error_kind.eq(&mv.error_kind),
                    m::error_message.eq(&mv.error_message),
                ))
                .execute(conn)?;

            use schema::rethink_attempts::dsl as r;
            diesel::delete(r::rethink_attempts.filter(r::move_id.eq(move_id))).execute(conn)?;
            for attempt in &attempts {
                insert_rethink_row(conn, move_id, attempt)?;
            }
            Ok(affected)
        });
        Ok(affected.map_err(StorageError::from)? > 0)
    }

    async fn append_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: &RethinkAttempt,
    ) -> StorageResult<bool> {
        attempt.validate()?;
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        let move_id: Option<i64> = m::moves
            .filter(m::game_id.eq(game_id))
            .filter(m::move_number.eq(move_number))
            .filter(m::player.eq(player))
            .select(m::id)
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match move_id {
            None => Ok(false),
            Some(id) => {
                insert_rethink_row(&mut conn, id, attempt)?;
                Ok(true)
            }
        }
    }

    async fn upsert_player_stats(&self, stats: &PlayerStats) -> StorageResult<()> {
        stats.validate()?;
        use schema::player_stats::dsl as s;
        let mut conn = self.conn()?;
        diesel::insert_into(schema::player_stats::table)
            .values((
                s::player_id.eq(&stats.player_id),
                s::games_played.eq(stats.games_played),
                s::wins.eq(stats.wins),
                s::losses.eq(stats.losses),
                s::draws.eq(stats.draws),
                s::illegal_move_rate.eq(stats.illegal_move_rate),
                s::average_thinking_time_ms.eq(stats.average_thinking_time_ms),
                s::elo_rating.eq(stats.elo_rating),
                s::last_updated.eq(stats.last_updated),
            ))
            .on_conflict(s::player_id)
            .do_update()
            .set((
                s::games_played.eq(stats.games_played),
                s::wins.eq(stats.wins),
                s::losses.eq(stats.losses),
                s::draws.eq(stats.draws),
                s::illegal_move_rate.eq(stats.illegal_move_rate),
                s::average_thinking_time_ms.eq(stats.average_thinking_time_ms),
                s::elo_rating.eq(stats.elo_rating),
                s::last_updated.eq(stats.last_updated),
            ))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get_player_stats(&self, player_id: &str) -> StorageResult<Option<PlayerStats>> {
        use schema::player_stats::dsl as s;
        let mut conn = self.conn()?;
        let row: Option<PlayerStatsRow> = s::player_stats
            .filter(s::player_id.eq(player_id))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(PlayerStats::from))
    }

    async fn query_games(
        &self,
        filters: &GameFilters,
        pagination: Pagination,
    ) -> StorageResult<Vec<Game>> {
        use schema::games::dsl as g;
        let mut conn = self.conn()?;
        let mut query = g::games.into_boxed();
        query = apply_game_filters(query, filters);
        query = query.order(g::start_time.desc());
        if let Some(limit) = pagination.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = pagination.offset {
            query = query.offset(offset);
        }
        let rows: Vec<GameRow> = query
            .select((
                g::game_id,
                g::tournament_id,
                g::start_time,
                g::end_time,
                g::black_player_id,
                g::black_player_json,
                g::white_player_id,
                g::white_player_json,
                g::initial_fen,
                g::final_fen,
                g::outcome_result,
                g::outcome_winner,
                g::outcome_termination,
                g::total_moves,
                g::duration_seconds,
                g::metadata,
            ))
            .load(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(GameRow::into_game).collect()
    }

    async fn count_games(&self, filters: &GameFilters) -> StorageResult<i64> {
        use schema::games::dsl as g;
        let mut conn = self.conn()?;
        let mut query = g::games.into_boxed();
        query = apply_game_filters(query, filters);
        query
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)
    }

    async fn delete_games_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<i64> {
        use schema::games::dsl as g;
        let mut conn = self.conn()?;
        let affected = diesel::delete(g::games.filter(g::start_time.lt(cutoff)))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected as i64)
    }

    async fn storage_stats(&self) -> StorageResult<StorageStats> {
        use schema::games::dsl as g;
        use schema::moves::dsl as m;
        use schema::players::dsl as p;
        let mut conn = self.conn()?;
        let game_count: i64 = g::games.select(count_star()).first(&mut conn).map_err(StorageError::from)?;
        let move_count: i64 = m::moves.select(count_star()).first(&mut conn).map_err(StorageError::from)?;
        let player_count: i64 = p::players.select(count_star()).first(&mut conn).map_err(StorageError::from)?;
        let pool = self.pool.get().map(|pool| PoolInfo {
            max_size: pool.max_size(),
            in_use: pool.state().connections - pool.state().idle_connections,
        });
        Ok(StorageStats {
            backend: BackendKind::Pooled,
            game_count,
            move_count,
            player_count,
            approximate_size_bytes: 0,
            pool,
        })
    }

    async fn count_orphaned_moves(&self) -> StorageResult<i64> {
        use schema::games::dsl as g;
        use schema::moves::dsl as m;
        let mut conn = self.conn()?;
        m::moves
            .left_join(schema::games::table)
            .filter(g::game_id.nullable().is_null())
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)
    }
}

fn insert_rethink_row(conn: &mut PgConn, move_id: i64, attempt: &RethinkAttempt) -> StorageResult<()> {
    use schema::rethink_attempts::dsl as r;
    diesel::insert_into(schema::rethink_attempts::table)
        .values((
            r::move_id.eq(move_id),
            r::attempt_number.eq(attempt.attempt_number),
            r::prompt_text.eq(&attempt.prompt_text),
            r::raw_response.eq(&attempt.raw_response),
            r::parsed_move.eq(&attempt.parsed_move),
            r::was_legal.eq(attempt.was_legal),
            r::timestamp.eq(attempt.timestamp),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn load_rethink_rows(conn: &mut PgConn, move_id: i64) -> StorageResult<Vec<RethinkAttempt>> {
    use schema::rethink_attempts::dsl as r;
    let rows: Vec<RethinkRow> = r::rethink_attempts
        .filter(r::move_id.eq(move_id))
        .order(r::attempt_number.asc())
        .select((
            r::attempt_number,
            r::prompt_text,
            r::raw_response,
            r::parsed_move,
            r::was_legal,
            r::timestamp,
        ))
        .load(conn)
        .map_err(StorageError::from)?;
    Ok(rows.into_iter().map(RethinkAttempt::from).collect())
}

fn apply_game_filters<'a>(
    mut query: schema::games::BoxedQuery<'a, diesel::pg::Pg>,
    filters: &'a GameFilters,
) -> schema::games::BoxedQuery<'a, diesel::pg::Pg> {
    use schema::games::dsl as g;
    if let Some(tournament_id) = &filters.tournament_id {
        query = query.filter(g::tournament_id.eq(tournament_id));
    }
    if let Some(start_date) = filters.start_date {
        query = query.filter(g::start_time.ge(start_date));
    }
    if let Some(end_date) = filters.end_date {
        query = query.filter(g::start_time.le(end_date));
    }
    if let Some(result) = filters.outcome_result {
        query = query.filter(g::outcome_result.eq(result_to_str(result)));
    }
    if let Some(player_id) = &filters.player_id {
        query = query.filter(
            g::black_player_id
                .eq(player_id)
                .or(g::white_player_id.eq(player_id)),
        );
    }
    if let Some(players) = &filters.players {
        for player_id in players {
            query = query.filter(
                g::black_player_id
                    .eq(player_id.clone())
                    .or(g::white_player_id.eq(player_id.clone())),
            );
        }
    }
    query
}
