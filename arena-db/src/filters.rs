//! Closed filter vocabularies for game and move queries. Kept as explicit
//! structs (rather than a free-form map) so the set of accepted filters is
//! enumerable at compile time, per spec §4.2's "the filter set is closed".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::GameResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameFilters {
    pub tournament_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub outcome_result: Option<GameResult>,
    pub player_id: Option<String>,
    /// Games containing *all* of these player ids.
    pub players: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoveFilters {
    pub is_legal: Option<bool>,
    pub parsing_success: Option<bool>,
    pub has_rethink: Option<bool>,
    pub blunder_flag: Option<bool>,
    pub min_thinking_time_ms: Option<i64>,
    pub max_thinking_time_ms: Option<i64>,
    pub player: Option<i16>,
}

impl MoveFilters {
    /// Applies the filter set as a logical AND over a single move.
    pub fn matches(&self, mv: &crate::models::Move) -> bool {
        if let Some(is_legal) = self.is_legal {
            if mv.is_legal != is_legal {
                return false;
            }
        }
        if let Some(parsing_success) = self.parsing_success {
            if mv.parsing_success != parsing_success {
                return false;
            }
        }
        if let Some(has_rethink) = self.has_rethink {
            if mv.had_rethink() != has_rethink {
                return false;
            }
        }
        if let Some(blunder_flag) = self.blunder_flag {
            if mv.blunder_flag != blunder_flag {
                return false;
            }
        }
        if let Some(min) = self.min_thinking_time_ms {
            if mv.thinking_time_ms < min {
                return false;
            }
        }
        if let Some(max) = self.max_thinking_time_ms {
            if mv.thinking_time_ms > max {
                return false;
            }
        }
        if let Some(player) = self.player {
            if mv.player.0 != player {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Move, PlayerIndex};
    use chrono::Utc;

    fn move_with(is_legal: bool, thinking: i64) -> Move {
        Move {
            game_id: "g".into(),
            move_number: 1,
            player: PlayerIndex::WHITE,
            timestamp: Utc::now(),
            fen_before: "a".into(),
            fen_after: "b".into(),
            legal_moves: vec![],
            move_san: "e4".into(),
            move_uci: "e2e4".into(),
            is_legal,
            prompt_text: "p".into(),
            raw_response: "r".into(),
            parsed_move: None,
            parsing_success: true,
            parsing_attempts: 1,
            thinking_time_ms: thinking,
            api_call_time_ms: 0,
            parsing_time_ms: 0,
            rethink_attempts: vec![],
            move_quality_score: None,
            blunder_flag: false,
            error_kind: None,
            error_message: None,
        }
    }

    #[test]
    fn filters_compose_with_and() {
        let filters = MoveFilters {
            is_legal: Some(true),
            min_thinking_time_ms: Some(100),
            ..Default::default()
        };
        assert!(filters.matches(&move_with(true, 150)));
        assert!(!filters.matches(&move_with(true, 50)));
        assert!(!filters.matches(&move_with(false, 150)));
    }
}
