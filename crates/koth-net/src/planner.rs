//! Competition and team subnet arithmetic.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::debug;

/// Errors raised by subnet allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("no available /{prefix} subnets remain in pool {pool}")]
    PoolExhausted { prefix: u8, pool: Ipv4Net },

    #[error("team index {index} exceeds the {capacity} team subnets available")]
    BadTeamIndex { index: u32, capacity: u32 },

    #[error("host offset {offset} is invalid for /{prefix}")]
    InvalidHostOffset { offset: u32, prefix: u8 },

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("prefix ordering invalid: pool /{pool} <= competition /{competition} < team /{team} required")]
    PrefixOrdering { pool: u8, competition: u8, team: u8 },
}

/// Carves competition subnets from the pool and team subnets from a
/// competition subnet.
#[derive(Debug, Clone, Copy)]
pub struct NetworkPlanner {
    pool: Ipv4Net,
    competition_prefix: u8,
    team_prefix: u8,
}

impl NetworkPlanner {
    /// Create a planner; the prefix ordering must be
    /// pool <= competition < team <= /30.
    pub fn new(pool: Ipv4Net, competition_prefix: u8, team_prefix: u8) -> Result<Self, NetError> {
        if competition_prefix < pool.prefix_len()
            || team_prefix <= competition_prefix
            || team_prefix > 30
        {
            return Err(NetError::PrefixOrdering {
                pool: pool.prefix_len(),
                competition: competition_prefix,
                team: team_prefix,
            });
        }

        Ok(Self {
            pool: pool.trunc(),
            competition_prefix,
            team_prefix,
        })
    }

    /// Prefix length of team subnets.
    pub fn team_prefix(&self) -> u8 {
        self.team_prefix
    }

    /// Prefix length of competition subnets.
    pub fn competition_prefix(&self) -> u8 {
        self.competition_prefix
    }

    /// How many team subnets fit inside one competition subnet.
    pub fn max_teams_per_competition(&self) -> u32 {
        1u32 << (self.team_prefix - self.competition_prefix)
    }

    /// Allocate the first competition subnet not present in `used`.
    ///
    /// Candidates are enumerated in ascending order over the pool, so
    /// allocations are deterministic given the same used set.
    pub fn allocate_competition_subnet(&self, used: &[Ipv4Net]) -> Result<Ipv4Net, NetError> {
        let used: Vec<Ipv4Net> = used.iter().map(|n| n.trunc()).collect();
        let base = u32::from(self.pool.network());
        let subnet_size = 1u64 << (32 - self.competition_prefix);
        let available = 1u64 << (self.competition_prefix - self.pool.prefix_len());

        for index in 0..available {
            let start = base as u64 + index * subnet_size;
            if start > u32::MAX as u64 {
                break;
            }
            let candidate = build_subnet(start as u32, self.competition_prefix)?;
            if !used.contains(&candidate) {
                debug!(subnet = %candidate, "allocated competition subnet");
                return Ok(candidate);
            }
        }

        Err(NetError::PoolExhausted {
            prefix: self.competition_prefix,
            pool: self.pool,
        })
    }

    /// Base address of a team's subnet inside a competition subnet.
    pub fn team_subnet_base(&self, competition: Ipv4Net, team_index: u32) -> Result<u32, NetError> {
        let capacity = self.max_teams_per_competition();
        if team_index >= capacity {
            return Err(NetError::BadTeamIndex {
                index: team_index,
                capacity,
            });
        }

        let step = 1u32 << (32 - self.team_prefix);
        Ok(u32::from(competition.trunc().network()) + team_index * step)
    }

    /// The full team subnet for a team index.
    pub fn team_subnet(&self, competition: Ipv4Net, team_index: u32) -> Result<Ipv4Net, NetError> {
        let base = self.team_subnet_base(competition, team_index)?;
        build_subnet(base, self.team_prefix)
    }

    /// A container's host address inside a team subnet.
    ///
    /// Offsets 0 (network) and the broadcast address are rejected.
    pub fn host_ip(&self, team_base: u32, last_octet: u32) -> Result<Ipv4Addr, NetError> {
        host_ip_within_subnet(team_base, self.team_prefix, last_octet)
    }
}

/// Host address at `offset` inside the subnet starting at `subnet_base`.
pub fn host_ip_within_subnet(
    subnet_base: u32,
    subnet_prefix: u8,
    offset: u32,
) -> Result<Ipv4Addr, NetError> {
    let host_capacity = 1u32 << (32 - subnet_prefix);
    if offset == 0 || offset >= host_capacity - 1 {
        return Err(NetError::InvalidHostOffset {
            offset,
            prefix: subnet_prefix,
        });
    }

    Ok(Ipv4Addr::from(subnet_base + offset))
}

/// Build the subnet containing `start`, masked down to `prefix`.
pub fn build_subnet(start: u32, prefix: u8) -> Result<Ipv4Net, NetError> {
    Ipv4Net::new(Ipv4Addr::from(start), prefix)
        .map(|net| net.trunc())
        .map_err(|_| NetError::InvalidCidr(format!("{}/{prefix}", Ipv4Addr::from(start))))
}
