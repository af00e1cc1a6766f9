//! Bridge a bare-metal provisioning manager's power model onto a cloud
//! application VM API.
//!
//! The remote backend owns a tree of VMs whose lifecycle states change
//! asynchronously and can be mutated by other actors at any time. This
//! crate reads a snapshot of that tree, classifies the observed state
//! against the requested action, and executes the resulting decision
//! under a deadline- and status-budgeted retry loop. It also allocates
//! subnet-local addresses when drafting new VM network interfaces.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use cloudnode::api::{ApplicationApi, CloudClient};
//! use cloudnode::power::PowerManager;
//! use cloudnode::retry::AttemptState;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CloudClient::new("user", "secret")?;
//!     let app = client.find_application("my-stack").await?;
//!
//!     let manager = PowerManager::new(&client, Duration::from_secs(7200));
//!     let mut state = AttemptState::new(app);
//!     manager.start(&mut state, "node1").await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::net::Ipv4Addr;

use thiserror::Error as ThisError;

pub mod address;
pub mod api;
pub mod config;
pub mod nodes;
pub mod power;
pub mod provision;
pub mod retry;

pub use api::{ApiError, ApplicationApi, CloudClient};
pub use config::Config;
pub use power::{classify, BootDevice, Decision, PowerAction, PowerManager};
pub use retry::{AttemptState, RetryError, RetryPolicy};

/// Precondition faults. These are never retried: the input or the local
/// environment is wrong, and trying again cannot fix it.
#[derive(ThisError, Debug)]
pub enum Error {
    /// No VM with the given name exists in the application.
    #[error("unknown node `{0}`")]
    UnknownNode(String),

    /// The VM has no DISK drive to boot from.
    #[error("vm `{0}` does not have a DISK drive")]
    NoDisk(String),

    /// The VM reports no lifecycle state.
    #[error("vm `{0}` reports no state")]
    NoVmState(String),

    /// The VM has not been assigned a backend id yet.
    #[error("vm `{0}` has no id (unpublished?)")]
    NoVmId(String),

    /// The application has no VM to use as a provisioning template.
    #[error("application `{0}` has no template node")]
    NoTemplateNode(String),

    /// A subnet has no existing address to extend from.
    #[error("no existing address on subnet {subnet}/{mask} to extend from")]
    NoTemplateAddress { subnet: Ipv4Addr, mask: Ipv4Addr },

    /// All addresses on the subnet are taken.
    #[error("no more addresses left on subnet {subnet}/{mask}")]
    NoAddressAvailable { subnet: Ipv4Addr, mask: Ipv4Addr },

    /// A template interface lacks a static IP configuration.
    #[error("interface `{0}` has no static IP configuration")]
    MissingStaticIp(String),

    /// Boot device string was neither `hd` nor `network`.
    #[error("invalid boot device `{0}` (expected `hd` or `network`)")]
    InvalidBootDevice(String),
}
