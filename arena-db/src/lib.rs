//! Domain model, the `Backend` capability trait, and the two concrete
//! storage backends (`embedded`, a sled-backed single-writer store; `pooled`,
//! a diesel+r2d2 PostgreSQL store) underlying arena-telemetry.

pub mod backend;
pub mod error;
pub mod filters;
pub mod models;
mod schema;

pub use backend::{Backend, BackendKind, GameUpdate, PoolInfo, StorageStats};
pub use backend::embedded::{EmbeddedBackend, EmbeddedConfig};
pub use backend::pooled::{PooledBackend, PooledConfig};
pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use filters::{GameFilters, MoveFilters, Pagination};
pub use models::{
    validate_rethink_sequence, AgentType, DEFAULT_INITIAL_FEN, Game, GameOutcome, GameResult,
    Move, MoveKey, PlayerIndex, PlayerInfo, PlayerStats, RethinkAttempt, TerminationReason,
};
