//! koth-state — embedded record store for KOTH.
//!
//! Backed by [redb](https://docs.rs/redb), persists competitions, teams,
//! container records, score results and uploaded packages. All domain
//! types are JSON-serialized into redb's `&[u8]` value columns; composite
//! keys (`{team_id}:{container_order}:{check_order}:{check_id}`) enable
//! prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks. An in-memory
//! backend is available for tests.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
