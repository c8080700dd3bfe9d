//! koth-stream — in-memory jobs with an ordered, replayable log stream.
//!
//! A [`StreamJob`] is a long-running operation whose progress log fans out
//! to any number of live subscribers. New subscribers replay the full log
//! before receiving live messages; slow subscribers drop messages rather
//! than blocking the producer; `done` closes every channel exactly once.
//!
//! Three specialized jobs wrap the kernel with metadata only
//! ([`UploadJob`], [`RedeployJob`], [`TeardownJob`]) and live in
//! independent owner-gated registries.

pub mod job;
pub mod jobs;
pub mod logger;
pub mod registry;

pub use job::StreamJob;
pub use jobs::{RedeployJob, TeardownJob, UploadJob, UploadStatus};
pub use logger::JobLogger;
pub use registry::{JobRegistry, Registered};
