//! koth.toml configuration parser.
//!
//! The daemon reads a single TOML file. A missing file is scaffolded with
//! defaults so an operator can fill in the required values. Networking is
//! validated at load time — a pool that cannot supply competition subnets
//! is a startup error, not a runtime surprise.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode config template: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid network configuration: {0}")]
    Network(String),

    #[error("config file was missing; wrote a template to {0} — fill it in and restart")]
    TemplateWritten(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub hypervisor: HypervisorConfig,
    pub directory: DirectoryConfig,
    pub network: NetworkConfig,
    pub restrictions: RestrictionCaps,
    pub auth: AuthConfig,
}

/// Web server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Listen address, e.g. ":8080" or "0.0.0.0:8080".
    pub address: String,
    /// Directory containing `fullchain.pem` / `privkey.pem`. Empty = plain HTTP.
    pub tls_dir: String,
    /// Addresses that should redirect to the TLS listener.
    pub redirect_addresses: Vec<String>,
    /// Externally reachable base URL advertised to containers.
    pub public_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            tls_dir: String::new(),
            redirect_addresses: Vec::new(),
            public_url: String::new(),
        }
    }
}

/// Storage layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for packages, competition data and the record store.
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./koth_live_data".to_string(),
        }
    }
}

/// Hypervisor endpoint settings. The REST/console client consumes these;
/// token credentials drive API calls, the username/password pair is only
/// needed for the ticket-based console path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HypervisorConfig {
    pub host: String,
    pub port: u16,
    pub token_id: String,
    pub token_secret: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed certificates on the hypervisor endpoint.
    pub insecure_skip_verify: bool,
}

/// Directory-service settings (external collaborator; carried through to
/// whatever identity provider the deployment wires in).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    pub address: String,
    pub admin_groups: Vec<String>,
    pub user_groups: Vec<String>,
}

/// Local fallback accounts for deployments without a directory service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<StaticUser>,
}

/// A statically configured account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Network carving settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pool from which competition subnets are carved.
    pub pool_cidr: String,
    /// Prefix length of each competition subnet.
    pub competition_prefix: u8,
    /// Prefix length of each team subnet.
    pub team_prefix: u8,
    /// Prefix length written into each container's interface config.
    pub container_prefix: u8,
    pub gateway: Ipv4Addr,
    pub nameserver: Ipv4Addr,
    pub search_domain: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pool_cidr: "10.0.0.0/8".to_string(),
            competition_prefix: 16,
            team_prefix: 24,
            container_prefix: 8,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            nameserver: Ipv4Addr::new(10, 0, 0, 2),
            search_domain: "cyber.lab".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Parse and validate the pool and prefix ordering.
    pub fn validated_pool(&self) -> Result<Ipv4Net, ConfigError> {
        let pool: Ipv4Net = self
            .pool_cidr
            .parse()
            .map_err(|e| ConfigError::Network(format!("pool_cidr {:?}: {e}", self.pool_cidr)))?;

        if self.competition_prefix < pool.prefix_len() {
            return Err(ConfigError::Network(format!(
                "competition_prefix /{} must not be wider than the pool /{}",
                self.competition_prefix,
                pool.prefix_len()
            )));
        }

        if self.team_prefix <= self.competition_prefix {
            return Err(ConfigError::Network(format!(
                "team_prefix /{} must be narrower than competition_prefix /{}",
                self.team_prefix, self.competition_prefix
            )));
        }

        if self.team_prefix > 30 || self.competition_prefix > 30 {
            return Err(ConfigError::Network(
                "subnet prefixes must leave room for host addresses".to_string(),
            ));
        }

        Ok(pool)
    }
}

/// Caps applied to uploaded container specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionCaps {
    /// Allowed container templates. Empty = any.
    pub allowed_templates: Vec<String>,
    /// Allowed storage pools. Empty = any.
    pub allowed_storage_pools: Vec<String>,
    pub max_cores: u32,
    pub max_memory_mb: u32,
    pub max_disk_gb: u32,
}

impl Default for RestrictionCaps {
    fn default() -> Self {
        Self {
            allowed_templates: Vec::new(),
            allowed_storage_pools: Vec::new(),
            max_cores: 4,
            max_memory_mb: 8192,
            max_disk_gb: 32,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            hypervisor: HypervisorConfig::default(),
            directory: DirectoryConfig::default(),
            network: NetworkConfig::default(),
            restrictions: RestrictionCaps::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// When the file does not exist, a template with defaults is written
    /// in its place and `TemplateWritten` is returned so the daemon exits
    /// with an actionable message instead of running half-configured.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let template = Config::default().to_toml_string()?;
            std::fs::write(path, template)?;
            return Err(ConfigError::TemplateWritten(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.network.validated_pool()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Root directory for persisted state, packages and competition data.
    pub fn storage_base(&self) -> &str {
        let base = self.storage.base_path.trim();
        if base.is_empty() {
            "./koth_live_data"
        } else {
            base
        }
    }

    /// Externally reachable base URL used inside containers.
    ///
    /// Prefers the configured `public_url`; otherwise derives scheme and
    /// host from the listen address and TLS settings.
    pub fn external_base_url(&self) -> String {
        let custom = self.web.public_url.trim();
        if !custom.is_empty() {
            return custom.trim_end_matches('/').to_string();
        }

        let scheme = if self.web.tls_dir.is_empty() {
            "http"
        } else {
            "https"
        };

        let addr = self.web.address.trim();
        let (host, port) = match addr.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => (addr, ""),
        };

        let host = if host.is_empty() || host == "0.0.0.0" || host == "::" {
            "127.0.0.1"
        } else {
            host
        };

        let default_port = (scheme == "http" && port == "80") || (scheme == "https" && port == "443");
        if port.is_empty() || default_port {
            format!("{scheme}://{host}")
        } else {
            format!("{scheme}://{host}:{port}")
        }
    }
}
