//! koth-scoring — the periodic scoring loop and the scoreboard.
//!
//! Every minute, each competition with active scoring gets a pass:
//! teams fan out in parallel, each container runs its scoring scripts
//! through the console-exec path, and the resulting check outcomes are
//! persisted wholesale (delete-then-insert per team). Team scores are
//! cumulative — each pass adds its delta.

pub mod engine;
pub mod error;
pub mod payload;
pub mod scoreboard;

pub use engine::ScoringEngine;
pub use error::{ScoringError, ScoringResult};
pub use payload::parse_check_payload;
pub use scoreboard::{
    build_scoreboard_competition, ScoreboardCheck, ScoreboardCompetition, ScoreboardContainer,
    ScoreboardTeam,
};
