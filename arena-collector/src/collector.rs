//! The event collector: a bounded-queue worker pool turning producer-side
//! events into storage-manager writes, per spec §4.3.
//!
//! Scheduling model grounded in the teacher's `mmoldb-ingest/src/main.rs`
//! shutdown idiom (`tokio_util::sync::CancellationToken` + bounded join
//! wait) generalized from "one background task" to "N worker tasks sharing
//! one bounded channel".

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arena_db::StorageErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::event::{Event, EventPayload};
use crate::handler::{dispatch, event_kind_label, EventHandler};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("submission queue is full")]
    QueueFull,
    #[error("collector has shut down")]
    Closed,
    #[error(transparent)]
    Event(#[from] crate::event::EventError),
}

/// Lock-guarded observable state, per spec §4.3's "Observable state (all
/// reads are lock-guarded snapshots)".
struct State {
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_retried: AtomicU64,
    queue_len: AtomicI64,
    recent_errors: StdMutex<VecDeque<String>>,
    recent_durations_ms: StdMutex<VecDeque<f64>>,
    active_games: StdMutex<HashSet<String>>,
    active_game_move_counts: StdMutex<std::collections::HashMap<String, u64>>,
    last_updated: StdMutex<DateTime<Utc>>,
}

impl State {
    fn new() -> Self {
        State {
            events_received: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_retried: AtomicU64::new(0),
            queue_len: AtomicI64::new(0),
            recent_errors: StdMutex::new(VecDeque::new()),
            recent_durations_ms: StdMutex::new(VecDeque::new()),
            active_games: StdMutex::new(HashSet::new()),
            active_game_move_counts: StdMutex::new(std::collections::HashMap::new()),
            last_updated: StdMutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_updated.lock().unwrap() = Utc::now();
    }

    fn record_error(&self, tail_size: usize, message: String) {
        let mut errors = self.recent_errors.lock().unwrap();
        errors.push_back(message);
        while errors.len() > tail_size {
            errors.pop_front();
        }
    }

    fn record_duration(&self, window: usize, duration: Duration) {
        let mut durations = self.recent_durations_ms.lock().unwrap();
        durations.push_back(duration.as_secs_f64() * 1000.0);
        while durations.len() > window {
            durations.pop_front();
        }
    }

    fn average_processing_time_ms(&self) -> f64 {
        let durations = self.recent_durations_ms.lock().unwrap();
        if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub recent_errors: Vec<String>,
    pub average_processing_time_ms: f64,
    pub queue_size: i64,
    pub last_updated: DateTime<Utc>,
    pub active_games: Vec<String>,
}

struct Inner {
    config: CollectorConfig,
    handler: Arc<dyn EventHandler>,
    tx: mpsc::Sender<Event>,
    rx: AsyncMutex<mpsc::Receiver<Event>>,
    state: State,
    cancel: CancellationToken,
    worker_handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Producer-facing handle to the collector. Cheap to clone: internally an
/// `Arc<Inner>`, matching the teacher's `Arc<Notify>`/`Arc<Pool>` sharing
/// pattern between `main` and background tasks.
#[derive(Clone)]
pub struct EventCollector {
    inner: Arc<Inner>,
}

impl EventCollector {
    pub fn new(config: CollectorConfig, handler: Arc<dyn EventHandler>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        EventCollector {
            inner: Arc::new(Inner {
                config,
                handler,
                tx,
                rx: AsyncMutex::new(rx),
                state: State::new(),
                cancel: CancellationToken::new(),
                worker_handles: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns `worker_threads` tasks consuming from the shared queue.
    pub fn start(&self) {
        let mut handles = self.inner.worker_handles.lock().unwrap();
        for worker_id in 0..self.inner.config.worker_threads.max(1) {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move { run_worker(inner, worker_id).await }));
        }
    }

    // --- Producer-side API (spec §4.3) ---------------------------------

    pub fn start_game(
        &self,
        game_id: impl Into<String>,
        players: BTreeMap<i16, Json>,
        metadata: BTreeMap<String, Json>,
    ) -> Result<bool, CollectorError> {
        if !self.inner.config.enabled {
            return Ok(false);
        }
        if self.sampled_out(self.inner.config.sample_rate) {
            return Ok(true);
        }
        let event = Event::new(game_id, EventPayload::GameStart { players, metadata })?;
        self.try_submit(event)
    }

    pub fn record_move(
        &self,
        game_id: impl Into<String>,
        fields: BTreeMap<String, Json>,
    ) -> Result<bool, CollectorError> {
        if !self.inner.config.enabled || !self.inner.config.collect_move_data {
            return Ok(true);
        }
        if self.sampled_out(self.inner.config.move_sample_rate) {
            return Ok(true);
        }
        let event = Event::new(game_id, EventPayload::MoveMade { fields })?;
        self.try_submit(event)
    }

    pub fn end_game(
        &self,
        game_id: impl Into<String>,
        outcome: arena_db::GameOutcome,
        final_fen: impl Into<String>,
        total_moves: i32,
    ) -> Result<bool, CollectorError> {
        if !self.inner.config.enabled {
            return Ok(false);
        }
        if let Some(min) = self.inner.config.min_game_length {
            if total_moves < min {
                return Ok(true);
            }
        }
        if let Some(max) = self.inner.config.max_game_length {
            if total_moves > max {
                return Ok(true);
            }
        }
        let event = Event::new(
            game_id,
            EventPayload::GameEnd {
                outcome,
                final_fen: final_fen.into(),
                total_moves,
            },
        )?;
        self.try_submit(event)
    }

    pub fn record_rethink_attempt(
        &self,
        game_id: impl Into<String>,
        move_number: i32,
        player: i16,
        fields: BTreeMap<String, Json>,
    ) -> Result<bool, CollectorError> {
        if !self.inner.config.enabled || !self.inner.config.collect_rethink_data {
            return Ok(true);
        }
        let event = Event::new(
            game_id,
            EventPayload::RethinkAttempt {
                move_number,
                player,
                fields,
            },
        )?;
        self.try_submit(event)
    }

    pub fn record_error(
        &self,
        game_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        context: BTreeMap<String, Json>,
    ) -> Result<bool, CollectorError> {
        if !self.inner.config.enabled {
            return Ok(false);
        }
        let event = Event::new(
            game_id,
            EventPayload::ErrorOccurred {
                kind: kind.into(),
                message: message.into(),
                context,
            },
        )?;
        self.try_submit(event)
    }

    pub fn snapshot(&self) -> CollectorSnapshot {
        let state = &self.inner.state;
        CollectorSnapshot {
            events_received: state.events_received.load(Ordering::Relaxed),
            events_processed: state.events_processed.load(Ordering::Relaxed),
            events_failed: state.events_failed.load(Ordering::Relaxed),
            events_retried: state.events_retried.load(Ordering::Relaxed),
            recent_errors: state.recent_errors.lock().unwrap().iter().cloned().collect(),
            average_processing_time_ms: state.average_processing_time_ms(),
            queue_size: state.queue_len.load(Ordering::Relaxed).max(0),
            last_updated: *state.last_updated.lock().unwrap(),
            active_games: state.active_games.lock().unwrap().iter().cloned().collect(),
        }
    }

    /// Cooperative shutdown per spec §4.3: stop workers from dequeuing new
    /// events, join them within `wait`, then drain anything left in the
    /// queue synchronously so no accepted event is silently lost.
    pub async fn shutdown(&self, wait: Duration) {
        self.inner.cancel.cancel();
        let handles = {
            let mut handles = self.inner.worker_handles.lock().unwrap();
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            if tokio::time::timeout(wait, handle).await.is_err() {
                log::warn!("collector worker did not finish within shutdown wait; abandoning");
            }
        }
        loop {
            let event = {
                let mut rx = self.inner.rx.lock().await;
                rx.try_recv()
            };
            match event {
                Ok(event) => {
                    self.inner.state.queue_len.fetch_sub(1, Ordering::Relaxed);
                    process_event(&self.inner, event).await;
                }
                Err(_) => break,
            }
        }
    }

    fn sampled_out(&self, rate: f64) -> bool {
        rate < 1.0 && fastrand::f64() > rate.max(0.0)
    }

    fn try_submit(&self, event: Event) -> Result<bool, CollectorError> {
        match self.inner.tx.try_send(event) {
            Ok(()) => {
                self.inner.state.events_received.fetch_add(1, Ordering::Relaxed);
                self.inner.state.queue_len.fetch_add(1, Ordering::Relaxed);
                self.inner.state.touch();
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.inner.config.continue_on_collection_error {
                    Ok(false)
                } else {
                    Err(CollectorError::QueueFull)
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CollectorError::Closed),
        }
    }
}

async fn run_worker(inner: Arc<Inner>, worker_id: usize) {
    log::debug!("collector worker {worker_id} starting");
    loop {
        let maybe_event = {
            let mut rx = inner.rx.lock().await;
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                event = rx.recv() => event,
            }
        };
        let Some(event) = maybe_event else {
            break;
        };
        inner.state.queue_len.fetch_sub(1, Ordering::Relaxed);
        process_event(&inner, event).await;
    }
    log::debug!("collector worker {worker_id} exiting");
}

async fn process_event(inner: &Arc<Inner>, mut event: Event) {
    if let EventPayload::GameStart { .. } = &event.payload {
        inner
            .state
            .active_games
            .lock()
            .unwrap()
            .insert(event.game_id.clone());
    }

    let started = Instant::now();
    let result = dispatch(inner.handler.as_ref(), &event).await;
    let duration = started.elapsed();
    inner
        .state
        .record_duration(inner.config.recent_durations_window, duration);
    inner.state.touch();

    if duration > inner.config.latency_ceiling() {
        log::warn!(
            "handler for {} exceeded latency ceiling: {:?} > {:?}",
            event_kind_label(event.kind()),
            duration,
            inner.config.latency_ceiling()
        );
    }

    match result {
        Ok(()) => {
            inner.state.events_processed.fetch_add(1, Ordering::Relaxed);
            match &event.payload {
                EventPayload::MoveMade { .. } => {
                    *inner
                        .state
                        .active_game_move_counts
                        .lock()
                        .unwrap()
                        .entry(event.game_id.clone())
                        .or_insert(0) += 1;
                }
                EventPayload::GameEnd { .. } => {
                    inner.state.active_games.lock().unwrap().remove(&event.game_id);
                    inner
                        .state
                        .active_game_move_counts
                        .lock()
                        .unwrap()
                        .remove(&event.game_id);
                }
                _ => {}
            }
        }
        Err(err) => {
            // Validation failures are never retried per spec §7; only
            // backend/transaction-class failures get a retry cycle.
            let retryable = !matches!(err.kind(), StorageErrorKind::Validation);
            if retryable && event.retry_count < inner.config.max_retry_attempts {
                tokio::time::sleep(inner.config.retry_delay()).await;
                event.retry_count += 1;
                inner.state.events_retried.fetch_add(1, Ordering::Relaxed);
                match inner.tx.try_send(event) {
                    Ok(()) => inner.state.queue_len.fetch_add(1, Ordering::Relaxed),
                    Err(_) => {
                        inner.state.events_failed.fetch_add(1, Ordering::Relaxed);
                        inner
                            .state
                            .record_error(inner.config.error_tail_size, err.to_string());
                    }
                };
            } else {
                inner.state.events_failed.fetch_add(1, Ordering::Relaxed);
                inner
                    .state
                    .record_error(inner.config.error_tail_size, err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_db::{Game, GameOutcome, RethinkAttempt, StorageError, StorageResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        games_created: AtomicUsize,
        fail_moves: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn create_game(&self, _game: Game) -> StorageResult<()> {
            self.games_created.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn add_move(
            &self,
            _game_id: &str,
            _fields: &BTreeMap<String, Json>,
        ) -> StorageResult<()> {
            if self.fail_moves {
                Err(StorageError::Backend(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated backend failure",
                ))))
            } else {
                Ok(())
            }
        }

        async fn complete_game(
            &self,
            _game_id: &str,
            _outcome: GameOutcome,
            _final_fen: String,
            _total_moves: i32,
        ) -> StorageResult<()> {
            Ok(())
        }

        async fn add_rethink_attempt(
            &self,
            _game_id: &str,
            _move_number: i32,
            _player: i16,
            _attempt: RethinkAttempt,
        ) -> StorageResult<()> {
            Ok(())
        }
    }

    fn players_payload() -> BTreeMap<i16, Json> {
        let mut map = BTreeMap::new();
        map.insert(
            0,
            serde_json::json!({"player_id": "black", "model_name": "m", "model_provider": "p", "agent_type": "custom", "agent_config": {}, "elo_rating": null}),
        );
        map.insert(
            1,
            serde_json::json!({"player_id": "white", "model_name": "m", "model_provider": "p", "agent_type": "custom", "agent_config": {}, "elo_rating": null}),
        );
        map
    }

    #[tokio::test]
    async fn queue_overflow_returns_false_and_leaves_counters_alone() {
        let mut config = CollectorConfig::default();
        config.queue_size = 1;
        config.worker_threads = 1;
        let handler = Arc::new(CountingHandler {
            games_created: AtomicUsize::new(0),
            fail_moves: false,
        });
        let collector = EventCollector::new(config, handler);
        // Don't start workers, so the queue never drains.
        let first = collector
            .start_game("g1", players_payload(), BTreeMap::new())
            .unwrap();
        let second = collector
            .start_game("g2", players_payload(), BTreeMap::new())
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(collector.snapshot().events_received, 1);
    }

    #[tokio::test]
    async fn accepted_events_drain_on_shutdown() {
        let mut config = CollectorConfig::default();
        config.queue_size = 10;
        config.worker_threads = 0;
        let handler = Arc::new(CountingHandler {
            games_created: AtomicUsize::new(0),
            fail_moves: false,
        });
        let collector = EventCollector::new(config, handler.clone());
        collector
            .start_game("g1", players_payload(), BTreeMap::new())
            .unwrap();
        collector.shutdown(Duration::from_millis(100)).await;
        assert_eq!(handler.games_created.load(Ordering::Relaxed), 1);
        assert_eq!(collector.snapshot().queue_size, 0);
    }

    #[tokio::test]
    async fn retry_then_permanent_failure_is_recorded() {
        let mut config = CollectorConfig::default();
        config.queue_size = 10;
        config.worker_threads = 1;
        config.max_retry_attempts = 1;
        config.retry_delay_seconds = 0;
        let handler = Arc::new(CountingHandler {
            games_created: AtomicUsize::new(0),
            fail_moves: true,
        });
        let collector = EventCollector::new(config, handler);
        collector.start();
        collector
            .record_move("g1", BTreeMap::from([("move_number".to_string(), serde_json::json!(1))]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.shutdown(Duration::from_millis(200)).await;
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.events_failed, 1);
        assert_eq!(snapshot.events_retried, 1);
        assert_eq!(snapshot.recent_errors.len(), 1);
    }
}
