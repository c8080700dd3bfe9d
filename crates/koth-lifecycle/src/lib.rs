//! koth-lifecycle — redeploy, teardown, power actions and status
//! reconciliation for provisioned fleets.
//!
//! Redeploy replaces a single container in place (same CTID, same IP);
//! teardown is best-effort destruction with combined-error semantics; a
//! background monitor keeps recorded power states fresh.

pub mod controller;
pub mod error;
pub mod monitor;

pub use controller::{normalize_ids, LifecycleController, PowerAction};
pub use error::{LifecycleError, LifecycleResult};
pub use monitor::{run_status_monitor, STATUS_REFRESH_INTERVAL};
