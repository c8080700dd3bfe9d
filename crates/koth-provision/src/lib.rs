//! koth-provision — one-shot fleet provisioning.
//!
//! Plans per-team containers from the package config, provisions them
//! concurrently (create → start → wait online → bootstrap over SSH),
//! records the results, and rolls the whole competition back on the
//! first failure.

pub mod engine;
pub mod error;
pub mod plan;

pub use engine::Provisioner;
pub use error::{ProvisionError, ProvisionResult};
pub use plan::{build_script_env, build_team_network, ContainerPlan, TeamNetwork};
