//! Migration bookkeeping shared by both backends.
//!
//! Schema changes are an ordered, append-only list of (version, name)
//! entries recorded in a `schema_migrations` table (pooled backend, via
//! `diesel_migrations`) or tree (embedded backend, hand-rolled over sled).
//! Two migrations are required by spec §4.1:
//!
//! 1. create the five tables with their cascade relationships and the
//!    `(game_id, move_number, player)` uniqueness constraint,
//! 2. add the secondary indexes listed in spec §4.1.
//!
//! Neither backend ever rewrites a prior migration; future schema changes are
//! additional numbered entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Versions known to this build, in application order. Both backends use
/// this list to decide what "pending" means; only the pooled backend's SQL
/// bodies live in `arena-db/migrations/*.sql` (diesel requires them on disk),
/// the embedded backend re-derives the same structural guarantees in Rust.
pub const KNOWN_MIGRATIONS: &[(i64, &str)] = &[
    (1, "create_core_tables"),
    (2, "add_secondary_indexes"),
];

pub fn latest_known_version() -> i64 {
    KNOWN_MIGRATIONS
        .iter()
        .map(|(v, _)| *v)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_migrations_are_two_as_specified() {
        assert_eq!(KNOWN_MIGRATIONS.len(), 2);
        assert_eq!(latest_known_version(), 2);
    }
}
