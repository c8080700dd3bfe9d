//! koth-net — subnet carving for competitions and teams.
//!
//! A configured IPv4 pool (e.g. `10.0.0.0/8`) is carved into
//! fixed-prefix competition subnets; each competition subnet is sliced
//! into contiguous team subnets indexed by team position; container IPs
//! are host offsets inside a team subnet. Pure address arithmetic — the
//! caller supplies the already-allocated subnets to skip.

pub mod planner;

pub use planner::{NetError, NetworkPlanner};
