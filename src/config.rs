//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every command, assembled by the CLI from flags and
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// API username.
    pub username: String,
    /// API password.
    pub password: String,
    /// Name of the application holding the nodes.
    pub application: String,
    /// API base URL override, if any.
    pub api_url: Option<String>,
    /// Minimum runtime the application must have left before a power
    /// action or a publish; the expiration is extended to this value
    /// when it is closer.
    pub min_runtime: Duration,
    /// Path of the node-description file.
    pub nodes_file: PathBuf,
    /// Private key file whose contents become each node's pm_password.
    pub ssh_key_file: Option<PathBuf>,
    /// Base image attached to new nodes' CDROM drives.
    pub iso_image_id: Option<u64>,
}
