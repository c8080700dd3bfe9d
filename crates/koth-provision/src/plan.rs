//! Container plans, team networks and the script environment.

use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use koth_core::sanitize::sanitize_container_name;
use koth_core::spec::TeamContainerConfig;
use koth_hypervisor::CtCreateSpec;
use koth_net::{NetError, NetworkPlanner};
use koth_state::TeamId;

/// The addresses a team's containers will hold, both by sanitized
/// config name and in config order.
#[derive(Debug, Clone, Default)]
pub struct TeamNetwork {
    pub ips_by_name: BTreeMap<String, String>,
    pub ip_order: Vec<String>,
}

/// Everything needed to provision one container.
#[derive(Debug, Clone)]
pub struct ContainerPlan {
    pub team_id: TeamId,
    pub team_index: u32,
    pub team_name: String,
    pub config_name: String,
    pub sanitized_name: String,
    /// Position of the config within the package.
    pub order: u32,
    pub ip_address: String,
    pub setup_scripts: Vec<String>,
    pub spec: CtCreateSpec,
}

/// Compute a team's container addresses from the competition subnet.
pub fn build_team_network(
    planner: &NetworkPlanner,
    competition: Ipv4Net,
    team_index: u32,
    configs: &[TeamContainerConfig],
) -> Result<TeamNetwork, NetError> {
    let base = planner.team_subnet_base(competition, team_index)?;

    let mut network = TeamNetwork::default();
    for config in configs {
        let ip = planner.host_ip(base, config.last_octet_value)?.to_string();
        network
            .ips_by_name
            .insert(sanitize_container_name(&config.name), ip.clone());
        network.ip_order.push(ip);
    }
    Ok(network)
}

/// Environment injected into setup and scoring scripts.
///
/// `KOTH_ACCESS_TOKEN` is appended by the caller because each script run
/// gets its own freshly issued token.
pub fn build_script_env(
    competition_id: &str,
    team_id: TeamId,
    hostname: &str,
    ip_address: &str,
    public_folder_url: &str,
    network: &TeamNetwork,
) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::from([
        ("KOTH_COMP_ID".to_string(), competition_id.to_string()),
        ("KOTH_TEAM_ID".to_string(), team_id.to_string()),
        ("KOTH_HOSTNAME".to_string(), hostname.to_string()),
        ("KOTH_IP".to_string(), ip_address.to_string()),
        ("KOTH_PUBLIC_FOLDER".to_string(), public_folder_url.to_string()),
        ("KOTH_CONTAINER_IPS".to_string(), network.ip_order.join(",")),
    ]);

    for (name, ip) in &network.ips_by_name {
        envs.insert(format!("KOTH_CONTAINER_IPS_{name}"), ip.clone());
    }

    envs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<TeamContainerConfig> {
        vec![
            TeamContainerConfig {
                name: "Web Server".to_string(),
                last_octet_value: 10,
                ..TeamContainerConfig::default()
            },
            TeamContainerConfig {
                name: "db".to_string(),
                last_octet_value: 20,
                ..TeamContainerConfig::default()
            },
        ]
    }

    fn planner() -> NetworkPlanner {
        NetworkPlanner::new("10.0.0.0/8".parse().unwrap(), 16, 24).unwrap()
    }

    #[test]
    fn team_network_follows_config_order() {
        let network = build_team_network(
            &planner(),
            "10.0.0.0/16".parse().unwrap(),
            2,
            &configs(),
        )
        .unwrap();

        assert_eq!(network.ip_order, vec!["10.0.2.10", "10.0.2.20"]);
        assert_eq!(network.ips_by_name["web_server"], "10.0.2.10");
        assert_eq!(network.ips_by_name["db"], "10.0.2.20");
    }

    #[test]
    fn script_env_names_every_sibling() {
        let network = build_team_network(
            &planner(),
            "10.0.0.0/16".parse().unwrap(),
            0,
            &configs(),
        )
        .unwrap();

        let envs = build_script_env(
            "demo",
            7,
            "koth-demo-team-1-web",
            "10.0.0.10",
            "https://koth.lab/api/competitions/demo/public/public",
            &network,
        );

        assert_eq!(envs["KOTH_COMP_ID"], "demo");
        assert_eq!(envs["KOTH_TEAM_ID"], "7");
        assert_eq!(envs["KOTH_CONTAINER_IPS"], "10.0.0.10,10.0.0.20");
        assert_eq!(envs["KOTH_CONTAINER_IPS_web_server"], "10.0.0.10");
        assert_eq!(envs["KOTH_CONTAINER_IPS_db"], "10.0.0.20");
        assert!(!envs.contains_key("KOTH_ACCESS_TOKEN"));
    }
}
