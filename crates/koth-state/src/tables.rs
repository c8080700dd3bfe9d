//! redb table definitions for the KOTH record store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except the counter table which allocates numeric team ids.

use redb::TableDefinition;

/// Competitions keyed by `{system_id}`.
pub const COMPETITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("competitions");

/// Teams keyed by `{team_id}` (zero-padded decimal).
pub const TEAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("teams");

/// Container records keyed by `{ctid}` (decimal).
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Score results keyed by `{team_id}:{container_order}:{check_order}:{check_id}`.
pub const SCORE_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("score_results");

/// Uploaded packages keyed by the lowercased competition id.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Monotonic id counters keyed by counter name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
