//! Container creation spec and its vendor option encoding.

use serde::{Deserialize, Serialize};

/// One name/value pair passed to the vendor create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtOption {
    pub name: String,
    pub value: String,
}

impl CtOption {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CtCreateSpec {
    pub template_path: String,
    pub storage_pool: String,
    pub hostname: String,
    pub root_password: String,
    pub root_ssh_public_key: String,
    pub storage_size_gb: u32,
    pub memory_mb: u32,
    pub cores: u32,
    pub gateway_ipv4: String,
    pub ipv4_address: String,
    /// Prefix length for the container's interface.
    pub cidr_block: u8,
    pub nameserver: String,
    pub search_domain: String,
}

impl CtCreateSpec {
    /// Encode as vendor options. Containers are always unprivileged with
    /// nesting enabled.
    pub fn to_options(&self) -> Vec<CtOption> {
        let mut opts = vec![
            CtOption::new("ostemplate", &self.template_path),
            CtOption::new("storage", &self.storage_pool),
            CtOption::new("hostname", &self.hostname),
            CtOption::new("password", &self.root_password),
        ];

        if !self.root_ssh_public_key.is_empty() {
            opts.push(CtOption::new("ssh-public-keys", &self.root_ssh_public_key));
        }

        opts.push(CtOption::new(
            "rootfs",
            format!("volume={}:{}", self.storage_pool, self.storage_size_gb),
        ));
        opts.push(CtOption::new("memory", self.memory_mb.to_string()));
        opts.push(CtOption::new("cores", self.cores.to_string()));
        opts.push(CtOption::new(
            "net0",
            format!(
                "name=eth0,bridge=vmbr0,firewall=1,gw={},ip={}/{}",
                self.gateway_ipv4, self.ipv4_address, self.cidr_block
            ),
        ));
        opts.push(CtOption::new("nameserver", &self.nameserver));

        if !self.search_domain.is_empty() {
            opts.push(CtOption::new("searchdomain", &self.search_domain));
        }

        opts.push(CtOption::new("unprivileged", "1"));
        opts.push(CtOption::new("features", "nesting=1"));

        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CtCreateSpec {
        CtCreateSpec {
            template_path: "isos:vztmpl/ubuntu.tar.zst".to_string(),
            storage_pool: "team".to_string(),
            hostname: "koth-demo-team-1-web".to_string(),
            root_password: "hunter2".to_string(),
            root_ssh_public_key: "ssh-rsa AAAA...".to_string(),
            storage_size_gb: 8,
            memory_mb: 2048,
            cores: 2,
            gateway_ipv4: "10.0.0.1".to_string(),
            ipv4_address: "10.0.0.10".to_string(),
            cidr_block: 8,
            nameserver: "10.0.0.2".to_string(),
            search_domain: "cyber.lab".to_string(),
        }
    }

    fn value_of<'a>(opts: &'a [CtOption], name: &str) -> Option<&'a str> {
        opts.iter().find(|o| o.name == name).map(|o| o.value.as_str())
    }

    #[test]
    fn options_encode_the_network_line() {
        let opts = spec().to_options();
        assert_eq!(
            value_of(&opts, "net0"),
            Some("name=eth0,bridge=vmbr0,firewall=1,gw=10.0.0.1,ip=10.0.0.10/8")
        );
        assert_eq!(value_of(&opts, "rootfs"), Some("volume=team:8"));
    }

    #[test]
    fn containers_are_unprivileged_with_nesting() {
        let opts = spec().to_options();
        assert_eq!(value_of(&opts, "unprivileged"), Some("1"));
        assert_eq!(value_of(&opts, "features"), Some("nesting=1"));
    }

    #[test]
    fn empty_key_and_search_domain_are_omitted() {
        let mut s = spec();
        s.root_ssh_public_key = String::new();
        s.search_domain = String::new();
        let opts = s.to_options();
        assert!(value_of(&opts, "ssh-public-keys").is_none());
        assert!(value_of(&opts, "searchdomain").is_none());
    }
}
