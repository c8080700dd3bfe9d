//! koth-intake — validated intake of uploaded competition packages.
//!
//! Takes the raw archive bytes through validation (size, path safety,
//! config presence, id availability, restriction caps) to a materialized
//! package directory and a persisted package record. Nothing here talks
//! to the hypervisor; a package that clears intake is merely eligible
//! for provisioning.

pub mod archive;
pub mod error;
pub mod package;

pub use archive::{inspect_archive, Attachment, IntakePlan, MAX_ARCHIVE_BYTES};
pub use error::IntakeError;
pub use package::{ensure_competition_id_available, materialize_package, validate_restrictions};
