//! The narrow write surface the collector's workers call into, per spec
//! §4.3's "Handlers (each performs one storage-manager op)". Kept as a
//! trait (rather than a direct dependency on the storage manager) so
//! `arena-collector` doesn't depend on `arena-telemetry` — the dependency
//! points the other way, the same inversion the teacher uses between
//! `mmoldb-ingest` and the `mmoldb_db::db` free functions it calls through a
//! plain `&mut PgConnection` rather than owning connection setup itself.

use arena_db::{Game, RethinkAttempt, StorageResult};
use async_trait::async_trait;

use crate::event::{EventKind, EventPayload};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn create_game(&self, game: Game) -> StorageResult<()>;
    async fn add_move(
        &self,
        game_id: &str,
        fields: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> StorageResult<()>;
    async fn complete_game(
        &self,
        game_id: &str,
        outcome: arena_db::GameOutcome,
        final_fen: String,
        total_moves: i32,
    ) -> StorageResult<()>;
    async fn add_rethink_attempt(
        &self,
        game_id: &str,
        move_number: i32,
        player: i16,
        attempt: RethinkAttempt,
    ) -> StorageResult<()>;
}

/// Dispatches one event to the handler method matching its kind. Returns the
/// validation/storage error unmodified; the caller (the worker loop) is
/// responsible for retry/failure bookkeeping.
pub async fn dispatch(handler: &dyn EventHandler, event: &crate::event::Event) -> StorageResult<()> {
    match &event.payload {
        EventPayload::GameStart { players, metadata } => {
            let game = build_game(&event.game_id, event.timestamp, players, metadata)?;
            handler.create_game(game).await
        }
        EventPayload::MoveMade { fields } => handler.add_move(&event.game_id, fields).await,
        EventPayload::GameEnd {
            outcome,
            final_fen,
            total_moves,
        } => {
            handler
                .complete_game(&event.game_id, outcome.clone(), final_fen.clone(), *total_moves)
                .await
        }
        EventPayload::RethinkAttempt {
            move_number,
            player,
            fields,
        } => {
            let attempt = build_rethink_attempt(fields)?;
            handler
                .add_rethink_attempt(&event.game_id, *move_number, *player, attempt)
                .await
        }
        EventPayload::ErrorOccurred { kind, message, .. } => {
            // Logged only, not persisted, per spec §4.3: "currently only
            // logged, not persisted (candidate for a future errors table)".
            log::warn!("error event for game {}: {kind}: {message}", event.game_id);
            Ok(())
        }
    }
}

pub fn event_kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::GameStart => "game_start",
        EventKind::MoveMade => "move_made",
        EventKind::GameEnd => "game_end",
        EventKind::RethinkAttempt => "rethink_attempt",
        EventKind::ErrorOccurred => "error_occurred",
    }
}

fn build_game(
    game_id: &str,
    start_time: chrono::DateTime<chrono::Utc>,
    players: &std::collections::BTreeMap<i16, serde_json::Value>,
    metadata: &std::collections::BTreeMap<String, serde_json::Value>,
) -> StorageResult<Game> {
    use arena_db::{PlayerInfo, StorageError, DEFAULT_INITIAL_FEN};

    let mut parsed_players = std::collections::BTreeMap::new();
    for (position, value) in players {
        let info: PlayerInfo = serde_json::from_value(value.clone())
            .map_err(|e| StorageError::Validation(format!("invalid player payload: {e}")))?;
        parsed_players.insert(*position, info);
    }

    Ok(Game {
        game_id: game_id.to_string(),
        tournament_id: metadata
            .get("tournament_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        start_time,
        end_time: None,
        players: parsed_players,
        initial_fen: metadata
            .get("initial_fen")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_INITIAL_FEN.to_string()),
        final_fen: None,
        outcome: None,
        total_moves: 0,
        duration_seconds: None,
        metadata: metadata.clone(),
    })
}

fn build_rethink_attempt(
    fields: &std::collections::BTreeMap<String, serde_json::Value>,
) -> StorageResult<RethinkAttempt> {
    use arena_db::StorageError;

    let required = |key: &str| -> StorageResult<String> {
        fields
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Validation(format!("missing required field: {key}")))
    };
    let attempt_number = fields
        .get("attempt_number")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| StorageError::Validation("missing required field: attempt_number".into()))?
        as i32;

    Ok(RethinkAttempt {
        attempt_number,
        prompt_text: required("prompt_text")?,
        raw_response: required("raw_response")?,
        parsed_move: fields
            .get("parsed_move")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        was_legal: fields
            .get("was_legal")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        timestamp: chrono::Utc::now(),
    })
}
