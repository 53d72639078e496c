//! Minimal smoke test: play one game end to end through the storage manager
//! against the configured backend and print the resulting ELO. Orchestrating
//! an actual tournament is out of scope for this binary; that lives in the
//! harness that calls this crate as a library.

use std::collections::BTreeMap;
use std::time::Duration;

use arena_db::{
    AgentType, Game, GameOutcome, GameResult, PlayerInfo, TerminationReason, DEFAULT_INITIAL_FEN,
};
use arena_telemetry::{ArenaConfig, StorageManager};
use chrono::Utc;
use log::info;
use miette::IntoDiagnostic;

fn demo_player(id: &str) -> PlayerInfo {
    PlayerInfo {
        player_id: id.to_string(),
        model_name: "demo-model".into(),
        model_provider: "demo-provider".into(),
        agent_type: AgentType::ChessLlmAgent,
        agent_config: BTreeMap::new(),
        elo_rating: None,
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = ArenaConfig::config().into_diagnostic()?;
    let backend = config.build_backend();
    let cache = arena_telemetry::monitoring::stats_cache(config.stats.cache_max_entries);
    let manager = StorageManager::new(backend, cache, config.manager_config());
    manager.connect().await.into_diagnostic()?;

    let mut players = BTreeMap::new();
    players.insert(0, demo_player("demo-black"));
    players.insert(1, demo_player("demo-white"));

    let game = Game {
        game_id: "demo-game".into(),
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
    };
    manager.create_game(game).await.into_diagnostic()?;
    info!("created demo-game");

    let outcome = GameOutcome::new(GameResult::Draw, None, TerminationReason::Stalemate)
        .into_diagnostic()?;
    manager
        .complete_game("demo-game", outcome, DEFAULT_INITIAL_FEN.to_string(), 0)
        .await
        .into_diagnostic()?;
    info!("completed demo-game as a draw");

    let stats = manager.get_player_stats("demo-white").await.into_diagnostic()?;
    info!("demo-white elo after one draw: {}", stats.elo_rating);

    manager.shutdown(Duration::from_secs(1)).await.into_diagnostic()?;
    Ok(())
}
