//! ELO, per-player statistics, leaderboards, head-to-head, performance
//! trends, batch recompute, and the dependency-tag statistics cache — the
//! statistics engine described in spec §4.4.

pub mod batch;
pub mod cache;
pub mod elo;
pub mod engine;

pub use cache::{cache_key, StatsCache};
pub use elo::{EloConfig, Score};
pub use engine::{
    classify_game, head_to_head, leaderboard, performance_trends, compute_player_statistics,
    DailyTrend, DataQualityMetrics, EloPoint, ExclusionReason, GameValidationIssue, HeadToHead,
    HeadToHeadGameSummary, LeaderboardEntry, LeaderboardSortBy, OpponentAnalysis,
    PlayerStatistics, RecentResult,
};
