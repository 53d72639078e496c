//! Core data model: games, players, moves, rethink attempts, and the
//! aggregated per-player stats record.
//!
//! Construction-time validation mirrors the invariants in spec §3 so that a
//! value of one of these types is, by the time it exists, already known-good;
//! the storage manager adds the cross-cutting invariants that need a backend
//! round trip (uniqueness, existence) on top.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{StorageError, StorageResult};

/// Black is 0, White is 1. Kept as a newtype rather than a bare `i32` so
/// backend code can't accidentally transpose it with `move_number` or
/// `winner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerIndex(pub i16);

impl PlayerIndex {
    pub const BLACK: PlayerIndex = PlayerIndex(0);
    pub const WHITE: PlayerIndex = PlayerIndex(1);

    pub fn is_valid(self) -> bool {
        self.0 == 0 || self.0 == 1
    }

    pub fn opponent(self) -> PlayerIndex {
        if self == PlayerIndex::WHITE {
            PlayerIndex::BLACK
        } else {
            PlayerIndex::WHITE
        }
    }
}

impl std::fmt::Display for PlayerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The known agent strategies an LLM-playing agent can be wrapped in. Unknown
/// but real strategies fall into `Custom` rather than being rejected, since
/// new harness-side agent types shouldn't require a schema migration here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    ChessLlmAgent,
    ChessRethinkAgent,
    Custom(String),
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::ChessLlmAgent => write!(f, "ChessLLMAgent"),
            AgentType::ChessRethinkAgent => write!(f, "ChessRethinkAgent"),
            AgentType::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl AgentType {
    pub fn parse(s: &str) -> AgentType {
        match s {
            "ChessLLMAgent" => AgentType::ChessLlmAgent,
            "ChessRethinkAgent" => AgentType::ChessRethinkAgent,
            other => AgentType::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player_id: String,
    pub model_name: String,
    pub model_provider: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub agent_config: BTreeMap<String, Json>,
    pub elo_rating: Option<f64>,
}

impl PlayerInfo {
    pub fn validate(&self) -> StorageResult<()> {
        if self.player_id.trim().is_empty() {
            return Err(StorageError::Validation("player_id cannot be empty".into()));
        }
        if self.model_name.trim().is_empty() {
            return Err(StorageError::Validation("model_name cannot be empty".into()));
        }
        if self.model_provider.trim().is_empty() {
            return Err(StorageError::Validation(
                "model_provider cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    WhiteWins,
    BlackWins,
    Draw,
    Ongoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Checkmate,
    Stalemate,
    Resignation,
    Timeout,
    InsufficientMaterial,
    ThreefoldRepetition,
    FiftyMoveRule,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameOutcome {
    pub result: GameResult,
    pub winner: Option<PlayerIndex>,
    pub termination: TerminationReason,
}

impl GameOutcome {
    pub fn new(
        result: GameResult,
        winner: Option<PlayerIndex>,
        termination: TerminationReason,
    ) -> StorageResult<Self> {
        let outcome = GameOutcome {
            result,
            winner,
            termination,
        };
        outcome.validate()?;
        Ok(outcome)
    }

    pub fn validate(&self) -> StorageResult<()> {
        match self.result {
            GameResult::WhiteWins if self.winner != Some(PlayerIndex::WHITE) => {
                Err(StorageError::Validation(
                    "WhiteWins outcome must have winner=1".into(),
                ))
            }
            GameResult::BlackWins if self.winner != Some(PlayerIndex::BLACK) => {
                Err(StorageError::Validation(
                    "BlackWins outcome must have winner=0".into(),
                ))
            }
            GameResult::Draw if self.winner.is_some() => Err(StorageError::Validation(
                "Draw outcome cannot have a winner".into(),
            )),
            _ => Ok(()),
        }
    }
}

pub const DEFAULT_INITIAL_FEN: &str =
    "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub game_id: String,
    pub tournament_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Keyed 0 (Black) and 1 (White); always exactly two entries.
    pub players: BTreeMap<i16, PlayerInfo>,
    pub initial_fen: String,
    pub final_fen: Option<String>,
    pub outcome: Option<GameOutcome>,
    pub total_moves: i32,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Json>,
}

impl Game {
    pub fn validate(&self) -> StorageResult<()> {
        if self.game_id.trim().is_empty() {
            return Err(StorageError::Validation("game_id cannot be empty".into()));
        }
        if self.players.len() != 2 || !self.players.contains_key(&0) || !self.players.contains_key(&1) {
            return Err(StorageError::Validation(
                "a game must have exactly two players keyed 0 (black) and 1 (white)".into(),
            ));
        }
        for info in self.players.values() {
            info.validate()?;
        }
        if self.initial_fen.trim().is_empty() {
            return Err(StorageError::Validation("initial_fen cannot be empty".into()));
        }
        if self.total_moves < 0 {
            return Err(StorageError::Validation("total_moves cannot be negative".into()));
        }
        if let Some(outcome) = &self.outcome {
            outcome.validate()?;
            if self.end_time.is_none() {
                return Err(StorageError::Validation(
                    "a game with an outcome must have an end_time".into(),
                ));
            }
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(StorageError::Validation(
                    "end_time cannot precede start_time".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.is_some() && self.end_time.is_some()
    }

    pub fn duration_minutes(&self) -> Option<f64> {
        self.duration_seconds.map(|s| s / 60.0)
    }

    pub fn player(&self, index: PlayerIndex) -> Option<&PlayerInfo> {
        self.players.get(&index.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RethinkAttempt {
    pub attempt_number: i32,
    pub prompt_text: String,
    pub raw_response: String,
    pub parsed_move: Option<String>,
    pub was_legal: bool,
    pub timestamp: DateTime<Utc>,
}

impl RethinkAttempt {
    pub fn validate(&self) -> StorageResult<()> {
        if self.attempt_number < 1 {
            return Err(StorageError::Validation(
                "attempt_number must be positive".into(),
            ));
        }
        if self.prompt_text.is_empty() {
            return Err(StorageError::Validation("prompt_text cannot be empty".into()));
        }
        if self.raw_response.is_empty() {
            return Err(StorageError::Validation("raw_response cannot be empty".into()));
        }
        Ok(())
    }
}

/// Checks that rethink attempt numbers run 1..N without gaps, in order.
pub fn validate_rethink_sequence(attempts: &[RethinkAttempt]) -> StorageResult<()> {
    for (expected, attempt) in (1..).zip(attempts) {
        if attempt.attempt_number != expected {
            return Err(StorageError::Validation(format!(
                "rethink attempts must be numbered 1..N without gaps; expected {expected}, found {}",
                attempt.attempt_number
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Move {
    pub game_id: String,
    pub move_number: i32,
    pub player: PlayerIndex,
    pub timestamp: DateTime<Utc>,

    pub fen_before: String,
    pub fen_after: String,
    pub legal_moves: Vec<String>,

    pub move_san: String,
    pub move_uci: String,
    pub is_legal: bool,

    pub prompt_text: String,
    pub raw_response: String,
    pub parsed_move: Option<String>,
    pub parsing_success: bool,
    pub parsing_attempts: i32,

    pub thinking_time_ms: i64,
    pub api_call_time_ms: i64,
    pub parsing_time_ms: i64,

    pub rethink_attempts: Vec<RethinkAttempt>,

    pub move_quality_score: Option<f64>,
    pub blunder_flag: bool,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl Move {
    pub fn validate(&self) -> StorageResult<()> {
        if self.game_id.trim().is_empty() {
            return Err(StorageError::Validation("game_id cannot be empty".into()));
        }
        if self.move_number < 1 {
            return Err(StorageError::Validation("move_number must be positive".into()));
        }
        if !self.player.is_valid() {
            return Err(StorageError::Validation("player must be 0 or 1".into()));
        }
        if self.fen_before.is_empty() || self.fen_after.is_empty() {
            return Err(StorageError::Validation(
                "fen_before and fen_after cannot be empty".into(),
            ));
        }
        if self.move_san.is_empty() || self.move_uci.is_empty() {
            return Err(StorageError::Validation(
                "move_san and move_uci cannot be empty".into(),
            ));
        }
        if self.prompt_text.is_empty() || self.raw_response.is_empty() {
            return Err(StorageError::Validation(
                "prompt_text and raw_response cannot be empty".into(),
            ));
        }
        if self.parsing_attempts < 1 {
            return Err(StorageError::Validation(
                "parsing_attempts must be positive".into(),
            ));
        }
        if self.thinking_time_ms < 0 || self.api_call_time_ms < 0 || self.parsing_time_ms < 0 {
            return Err(StorageError::Validation(
                "timing fields cannot be negative".into(),
            ));
        }
        validate_rethink_sequence(&self.rethink_attempts)?;
        for attempt in &self.rethink_attempts {
            attempt.validate()?;
        }
        Ok(())
    }

    pub fn total_time_ms(&self) -> i64 {
        self.thinking_time_ms + self.api_call_time_ms + self.parsing_time_ms
    }

    pub fn had_rethink(&self) -> bool {
        !self.rethink_attempts.is_empty()
    }
}

/// Uniquely identifies a stored move.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoveKey {
    pub game_id: String,
    pub move_number: i32,
    pub player: PlayerIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_id: String,
    pub games_played: i32,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
    pub illegal_move_rate: f64,
    pub average_thinking_time_ms: f64,
    pub elo_rating: f64,
    pub last_updated: DateTime<Utc>,
}

impl PlayerStats {
    pub fn new(player_id: impl Into<String>, default_elo: f64) -> Self {
        PlayerStats {
            player_id: player_id.into(),
            games_played: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            illegal_move_rate: 0.0,
            average_thinking_time_ms: 0.0,
            elo_rating: default_elo,
            last_updated: Utc::now(),
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.player_id.trim().is_empty() {
            return Err(StorageError::Validation("player_id cannot be empty".into()));
        }
        if self.games_played < 0 || self.wins < 0 || self.losses < 0 || self.draws < 0 {
            return Err(StorageError::Validation("game counts cannot be negative".into()));
        }
        if self.wins + self.losses + self.draws > self.games_played {
            return Err(StorageError::Validation(
                "wins + losses + draws cannot exceed games_played".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.illegal_move_rate) {
            return Err(StorageError::Validation(
                "illegal_move_rate must be within [0, 1]".into(),
            ));
        }
        if self.elo_rating < 0.0 {
            return Err(StorageError::Validation("elo_rating cannot be negative".into()));
        }
        Ok(())
    }

    pub fn win_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.wins as f64 / self.games_played as f64
        }
    }

    pub fn loss_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.losses as f64 / self.games_played as f64
        }
    }

    pub fn draw_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.draws as f64 / self.games_played as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str) -> PlayerInfo {
        PlayerInfo {
            player_id: id.to_string(),
            model_name: "gpt-test".to_string(),
            model_provider: "test-provider".to_string(),
            agent_type: AgentType::ChessLlmAgent,
            agent_config: BTreeMap::new(),
            elo_rating: None,
        }
    }

    fn base_game() -> Game {
        let mut players = BTreeMap::new();
        players.insert(0, player("black"));
        players.insert(1, player("white"));
        Game {
            game_id: "g1".into(),
            tournament_id: None,
            start_time: Utc::now(),
            end_time: None,
            players,
            initial_fen: DEFAULT_INITIAL_FEN.to_string(),
            final_fen: None,
            outcome: None,
            total_moves: 0,
            duration_seconds: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn game_requires_exactly_two_players_at_0_and_1() {
        let mut game = base_game();
        game.players.remove(&1);
        assert!(game.validate().is_err());
    }

    #[test]
    fn outcome_winner_consistency_white_wins() {
        let outcome = GameOutcome::new(
            GameResult::WhiteWins,
            Some(PlayerIndex::BLACK),
            TerminationReason::Checkmate,
        );
        assert!(outcome.is_err());

        let outcome = GameOutcome::new(
            GameResult::WhiteWins,
            Some(PlayerIndex::WHITE),
            TerminationReason::Checkmate,
        );
        assert!(outcome.is_ok());
    }

    #[test]
    fn outcome_draw_cannot_have_winner() {
        let outcome = GameOutcome::new(GameResult::Draw, Some(PlayerIndex::WHITE), TerminationReason::Stalemate);
        assert!(outcome.is_err());
    }

    #[test]
    fn game_with_outcome_requires_end_time() {
        let mut game = base_game();
        game.outcome = Some(
            GameOutcome::new(GameResult::Draw, None, TerminationReason::Stalemate).unwrap(),
        );
        assert!(game.validate().is_err());
        game.end_time = Some(game.start_time);
        assert!(game.validate().is_ok());
    }

    #[test]
    fn end_time_must_not_precede_start_time() {
        let mut game = base_game();
        game.outcome = Some(
            GameOutcome::new(GameResult::Draw, None, TerminationReason::Stalemate).unwrap(),
        );
        game.end_time = Some(game.start_time - chrono::Duration::seconds(1));
        assert!(game.validate().is_err());
    }

    #[test]
    fn rethink_attempts_must_be_gap_free() {
        let mk = |n: i32| RethinkAttempt {
            attempt_number: n,
            prompt_text: "p".into(),
            raw_response: "r".into(),
            parsed_move: None,
            was_legal: false,
            timestamp: Utc::now(),
        };
        assert!(validate_rethink_sequence(&[mk(1), mk(2), mk(3)]).is_ok());
        assert!(validate_rethink_sequence(&[mk(1), mk(3)]).is_err());
        assert!(validate_rethink_sequence(&[mk(2)]).is_err());
    }

    #[test]
    fn player_stats_sum_cannot_exceed_games_played() {
        let mut stats = PlayerStats::new("p1", 1200.0);
        stats.games_played = 2;
        stats.wins = 2;
        stats.losses = 1;
        assert!(stats.validate().is_err());
    }

    #[test]
    fn player_stats_illegal_move_rate_bounds() {
        let mut stats = PlayerStats::new("p1", 1200.0);
        stats.illegal_move_rate = 1.5;
        assert!(stats.validate().is_err());
        stats.illegal_move_rate = 0.2;
        assert!(stats.validate().is_ok());
    }
}
