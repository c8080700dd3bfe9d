//! Competition package schema — the parsed `config.json` of an upload.
//!
//! The on-disk format is camelCase JSON produced by competition authors.
//! Two fields are deliberately tolerant: `cidrBlock` accepts an integer or
//! a decimal string, and `ldapAllowedGroupsFilter` accepts a single string
//! or an array of strings.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// The full competition definition carried inside a package.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CompetitionConfig {
    #[serde(rename = "competitionID")]
    pub competition_id: String,
    pub competition_name: String,
    pub competition_description: String,
    pub competition_host: String,
    pub num_teams: u32,
    pub privacy: Privacy,
    pub container_specs: ContainerSpecs,
    pub team_container_configs: Vec<TeamContainerConfig>,
    pub setup_public_folder: String,
}

/// Visibility controls for a competition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Privacy {
    pub public: bool,
    #[serde(
        rename = "ldapAllowedGroupsFilter",
        deserialize_with = "string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_groups: Vec<String>,
}

/// Shared hypervisor parameters for every container in the competition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpecs {
    pub template_path: String,
    pub storage_pool: String,
    pub root_password: String,
    #[serde(rename = "storageSizeGB")]
    pub storage_size_gb: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
    pub cores: u32,
    #[serde(rename = "gatewayIPv4")]
    pub gateway_ipv4: String,
    #[serde(rename = "cidrBlock", deserialize_with = "int_or_decimal_string")]
    pub cidr_block: u8,
    #[serde(rename = "nameServerIPv4")]
    pub nameserver_ipv4: String,
    pub search_domain: String,
}

/// One container role per team ("web", "db", …).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamContainerConfig {
    pub name: String,
    pub last_octet_value: u32,
    pub setup_script: Vec<String>,
    pub scoring_script: Vec<String>,
    pub scoring_schema: Vec<ScoringCheck>,
}

/// A named boolean assertion with point values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringCheck {
    pub id: String,
    pub name: String,
    pub pass_points: i64,
    pub fail_points: i64,
}

impl CompetitionConfig {
    /// The public folder after sanitization, defaulting to `"public"`.
    pub fn public_folder(&self) -> String {
        let folder = crate::sanitize::sanitize_relative_path(&self.setup_public_folder);
        if folder.is_empty() {
            "public".to_string()
        } else {
            folder
        }
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<StringOrSeq>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrSeq::One(value)) => vec![value],
        Some(StringOrSeq::Many(values)) => values,
    })
}

fn int_or_decimal_string<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(u8),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(value) => Ok(value),
        IntOrString::Str(value) => value
            .trim()
            .parse::<u8>()
            .map_err(|_| de::Error::custom(format!("cidrBlock {value:?} is not a prefix length"))),
    }
}
