//! Domain types for the KOTH record store.
//!
//! These types represent the persisted state of competitions, teams,
//! container records, score results and uploaded packages. All types are
//! serializable to/from JSON for storage in redb tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hypervisor container id (CTID).
pub type ContainerId = i64;

/// Numeric team id allocated by the store.
pub type TeamId = i64;

// ── Competition ───────────────────────────────────────────────────

/// A bounded exercise with teams, containers, checks and a shared subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Competition {
    /// Stable unique identifier ("system id") from the package config.
    pub system_id: String,
    /// Unique display name.
    pub name: String,
    pub description: String,
    /// Host label shown on the scoreboard.
    pub host: String,
    pub is_private: bool,
    /// Directory-service groups allowed to view a private competition.
    pub allowed_groups: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Immutable package directory this competition was provisioned from.
    pub package_path: String,
    /// Public folder name inside the package directory.
    pub setup_public_folder: String,
    /// Competition subnet in CIDR notation.
    pub network_cidr: String,
    /// Hypervisor parameters shared by every container.
    pub restrictions: ContainerRestrictions,
    pub ssh_pub_key_path: String,
    pub ssh_priv_key_path: String,
    pub team_ids: Vec<TeamId>,
    pub container_ids: Vec<ContainerId>,
    /// When false, scoring passes skip this competition entirely.
    pub scoring_active: bool,
}

/// The restriction bundle recorded with a competition. Redeploys rebuild
/// containers from these values rather than re-reading the package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerRestrictions {
    pub hostname_prefix: String,
    pub root_password: String,
    pub template: String,
    pub storage_pool: String,
    pub gateway_ipv4: String,
    pub nameserver: String,
    pub search_domain: String,
    pub storage_gb: u32,
    pub memory_mb: u32,
    pub cores: u32,
    /// Prefix length written into each container's interface config.
    pub container_prefix: u8,
}

// ── Team ──────────────────────────────────────────────────────────

/// A player group owning a slice of the competition network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    /// Cumulative score; scoring passes add deltas.
    pub score: i64,
    /// Team subnet in CIDR notation.
    pub network_cidr: String,
    pub container_ids: Vec<ContainerId>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Container record ──────────────────────────────────────────────

/// Lifecycle status of a provisioned container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Redeploying,
    Unknown,
}

impl ContainerStatus {
    /// Parse a hypervisor-reported status string.
    pub fn from_runtime(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Redeploying => "redeploying",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One provisioned container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    /// Hypervisor CTID; doubles as the record key.
    pub ctid: ContainerId,
    pub ip_address: String,
    pub status: ContainerStatus,
    pub team_id: TeamId,
    /// Matches the team-container-config name in the package.
    pub config_name: String,
    pub storage_pool: String,
    pub node_name: String,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Score result ──────────────────────────────────────────────────

/// One check outcome from the most recent scoring pass for a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub team_id: TeamId,
    pub container_name: String,
    pub container_order: u32,
    pub check_id: String,
    pub check_name: String,
    pub check_order: u32,
    pub pass_points: i64,
    pub fail_points: i64,
    pub passed: bool,
    pub updated_at: DateTime<Utc>,
}

// ── Package ───────────────────────────────────────────────────────

/// An uploaded competition package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompetitionPackage {
    /// Competition system id (unique across uploads, case-insensitive).
    pub competition_id: String,
    pub competition_name: String,
    pub original_filename: String,
    /// Directory the archive was materialized into.
    pub storage_path: String,
    /// Serialized config.json bytes for scoring's fallback path.
    pub config_json: Vec<u8>,
    pub attachment_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Team {
    /// Build the table key for the teams table.
    pub fn table_key(id: TeamId) -> String {
        format!("{id:012}")
    }
}

impl ContainerRecord {
    /// Build the table key for the containers table.
    pub fn table_key(ctid: ContainerId) -> String {
        format!("{ctid}")
    }
}

impl ScoreResult {
    /// Build the composite key for the score results table.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:04}:{:04}:{}",
            self.team_id, self.container_order, self.check_order, self.check_id
        )
    }

    /// Prefix matching every score result belonging to a team.
    pub fn team_prefix(team_id: TeamId) -> String {
        format!("{team_id}:")
    }
}

impl CompetitionPackage {
    /// Build the table key for the packages table.
    pub fn table_key(competition_id: &str) -> String {
        competition_id.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_status_parses_known_states() {
        assert_eq!(ContainerStatus::from_runtime(" Running "), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_runtime("stopped"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_runtime(""), ContainerStatus::Unknown);
        assert_eq!(ContainerStatus::from_runtime("paused"), ContainerStatus::Unknown);
    }

    #[test]
    fn score_result_keys_order_by_container_then_check() {
        let make = |container_order, check_order, id: &str| ScoreResult {
            team_id: 7,
            container_name: "web".to_string(),
            container_order,
            check_id: id.to_string(),
            check_name: "Check".to_string(),
            check_order,
            pass_points: 10,
            fail_points: -5,
            passed: false,
            updated_at: Utc::now(),
        };

        let a = make(0, 1, "dns").table_key();
        let b = make(1, 0, "http").table_key();
        assert!(a < b);
        assert!(a.starts_with(&ScoreResult::team_prefix(7)));
    }

    #[test]
    fn team_prefix_does_not_capture_longer_ids() {
        // "1:" must not match keys for team 12.
        let key = format!("12:0000:0000:http");
        assert!(!key.starts_with(&ScoreResult::team_prefix(1)));
    }
}
