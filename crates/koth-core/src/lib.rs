//! koth-core — configuration and shared domain vocabulary for KOTH.
//!
//! Holds the daemon's TOML configuration (with defaults, template
//! generation and startup validation), the competition package schema
//! (the parsed `config.json` of an uploaded package), and the small
//! sanitization helpers shared by intake, provisioning and the HTTP
//! surface.

pub mod config;
pub mod sanitize;
pub mod spec;
pub mod urls;

pub use config::{Config, ConfigError, NetworkConfig, RestrictionCaps};
pub use spec::{CompetitionConfig, ContainerSpecs, Privacy, ScoringCheck, TeamContainerConfig};
