//! The `Event` envelope and its kind-specific payloads, per spec §4.3.
//!
//! Producer calls (`start_game`, `record_move`, ...) build one of these and
//! hand it to the collector's bounded queue. Construction-time validation
//! rejects empty ids and negative retry counts, mirroring the validation the
//! domain model applies in `arena_db::models`.

use std::collections::BTreeMap;

use arena_db::GameOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GameStart,
    MoveMade,
    GameEnd,
    RethinkAttempt,
    ErrorOccurred,
}

/// Kind-specific payload. `MoveMade` and `RethinkAttempt` carry a free-form
/// field map because spec §4.3 describes their shape as "the closed set of
/// fields listed... No other field names are accepted by the handler" — the
/// closed-ness is enforced by the handler at dispatch time, not by the type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    GameStart {
        players: BTreeMap<i16, Json>,
        metadata: BTreeMap<String, Json>,
    },
    MoveMade {
        fields: BTreeMap<String, Json>,
    },
    GameEnd {
        outcome: GameOutcome,
        final_fen: String,
        total_moves: i32,
    },
    RethinkAttempt {
        move_number: i32,
        player: i16,
        fields: BTreeMap<String, Json>,
    },
    ErrorOccurred {
        kind: String,
        message: String,
        context: BTreeMap<String, Json>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::GameStart { .. } => EventKind::GameStart,
            EventPayload::MoveMade { .. } => EventKind::MoveMade,
            EventPayload::GameEnd { .. } => EventKind::GameEnd,
            EventPayload::RethinkAttempt { .. } => EventKind::RethinkAttempt,
            EventPayload::ErrorOccurred { .. } => EventKind::ErrorOccurred,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub game_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub retry_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event id cannot be empty")]
    EmptyEventId,
    #[error("game id cannot be empty")]
    EmptyGameId,
}

impl Event {
    pub fn new(game_id: impl Into<String>, payload: EventPayload) -> Result<Self, EventError> {
        let game_id = game_id.into();
        if game_id.trim().is_empty() {
            return Err(EventError::EmptyGameId);
        }
        let event_id = uuid::Uuid::new_v4().to_string();
        Ok(Event {
            event_id,
            game_id,
            timestamp: Utc::now(),
            payload,
            retry_count: 0,
        })
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_game_id_is_rejected() {
        let err = Event::new(
            "",
            EventPayload::ErrorOccurred {
                kind: "test".into(),
                message: "m".into(),
                context: BTreeMap::new(),
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn fresh_event_starts_at_retry_zero() {
        let event = Event::new(
            "g1",
            EventPayload::ErrorOccurred {
                kind: "test".into(),
                message: "m".into(),
                context: BTreeMap::new(),
            },
        )
        .unwrap();
        assert_eq!(event.retry_count, 0);
        assert!(!event.event_id.is_empty());
    }
}
