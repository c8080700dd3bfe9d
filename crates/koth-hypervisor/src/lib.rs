//! koth-hypervisor — uniform container operations over a hypervisor cluster.
//!
//! The raw vendor surface (REST endpoints, console websocket) sits behind
//! the [`HypervisorClient`] and [`ConsoleChannel`] contracts. Everything
//! above — idempotent power actions, bucketed bulk operations, linear
//! retry wrappers, serialized creation, and the in-guest console-exec
//! protocol — lives here and is exercised against mocks.

pub mod adapter;
pub mod client;
pub mod console;
pub mod error;
pub mod mock;
pub mod rest;
pub mod spec;

pub use adapter::{BulkAction, CreateResult, HypervisorAdapter};
pub use client::{ConsoleChannel, ConsoleHandle, ContainerInfo, Ctid, HypervisorClient};
pub use console::{ConsoleTimeouts, ExecOutput};
pub use error::{HypervisorError, HvResult};
pub use rest::PveRestClient;
pub use spec::CtCreateSpec;
