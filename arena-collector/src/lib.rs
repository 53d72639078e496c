//! Bounded-queue worker pool turning agent-side events into validated
//! storage-manager writes, grounded on the teacher's `mmoldb-ingest` crate
//! (its single-stream consumer generalized here into a worker pool).

pub mod collector;
pub mod config;
pub mod event;
pub mod handler;

pub use collector::{CollectorError, CollectorSnapshot, EventCollector};
pub use config::CollectorConfig;
pub use event::{Event, EventError, EventKind, EventPayload};
pub use handler::{dispatch, event_kind_label, EventHandler};
