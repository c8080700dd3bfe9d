//! koth-ssh — SSH runtime for container bootstrap.
//!
//! The transport itself is a contract ([`SshClient`] / [`SshSession`]);
//! this crate owns everything above it: reachability waits,
//! connect-with-retry, authorized-key installation, keypair generation
//! and the script download command. A process-backed client shelling out
//! to OpenSSH ships as the default transport.

pub mod client;
pub mod command;
pub mod error;
pub mod keys;
pub mod mock;
pub mod process;
pub mod runtime;

pub use client::{CommandOutput, SshAuth, SshClient, SshSession};
pub use command::{build_script_command, set_envs};
pub use error::{SshError, SshResult};
pub use keys::{create_keypair_with_bits, create_ssh_keypair};
pub use process::ProcessSshClient;
pub use runtime::{connect_once_ready_with_retry, ensure_authorized_key, escape_single_quotes};
