//! The node-description file.
//!
//! After provisioning, node definitions are dumped to a JSON file that
//! the provisioning manager imports. Listing and MAC-lookup commands can
//! read the file back instead of hitting the API: the manager polls
//! those two queries constantly and their answers only change when a
//! node is added and re-dumped.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::Vm;

/// One node as the provisioning manager expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub arch: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub mac: Vec<String>,
    pub pm_type: String,
    pub pm_addr: String,
    pub pm_user: String,
    pub pm_password: String,
}

/// Power-management identity shared by every dumped node.
#[derive(Debug, Clone)]
pub struct PowerCredentials {
    /// Local user the manager connects back as.
    pub user: String,
    /// Private key material granting that access.
    pub key: String,
}

impl NodeRecord {
    /// Build a record from a deployed VM.
    #[must_use]
    pub fn from_vm(vm: &Vm, credentials: &PowerCredentials) -> Self {
        Self {
            name: vm.name.clone(),
            arch: "x86_64".to_string(),
            cpu: vm.num_cpus.unwrap_or_default().to_string(),
            memory: vm
                .memory_size
                .as_ref()
                .map(|s| s.in_mb())
                .unwrap_or_default()
                .to_string(),
            disk: vm
                .hard_drives
                .first()
                .and_then(|d| d.size.as_ref())
                .map(|s| s.in_gb())
                .unwrap_or_default()
                .to_string(),
            mac: vm.macs(),
            pm_type: "pxe_ssh".to_string(),
            pm_addr: "localhost".to_string(),
            pm_user: credentials.user.clone(),
            pm_password: credentials.key.clone(),
        }
    }
}

/// The on-disk file: `{"nodes": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesFile {
    pub nodes: Vec<NodeRecord>,
}

impl NodesFile {
    /// Load the file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read nodes file `{}`", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse nodes file `{}`", path.display()))
    }

    /// Write the file, pretty-printed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("failed to serialize nodes")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write nodes file `{}`", path.display()))?;
        info!(count = self.nodes.len(), path = %path.display(), "Wrote nodes file");
        Ok(())
    }

    /// MAC addresses recorded for `node`, if it is in the file.
    #[must_use]
    pub fn macs_for(&self, node: &str) -> Option<&[String]> {
        self.nodes
            .iter()
            .find(|n| n.name == node)
            .map(|n| n.mac.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> PowerCredentials {
        PowerCredentials {
            user: "stack".to_string(),
            key: "-----BEGIN KEY-----".to_string(),
        }
    }

    #[test]
    fn test_record_from_vm() {
        let vm: Vm = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "node1",
            "state": "STOPPED",
            "numCpus": 2,
            "memorySize": {"value": 8, "unit": "GB"},
            "hardDrives": [
                {"index": 1, "type": "DISK", "name": "sda", "boot": true,
                 "size": {"value": 60, "unit": "GB"}}
            ],
            "networkConnections": [
                {"name": "eth0",
                 "device": {"index": 0, "deviceType": "virtio", "mac": "2c:c2:60:00:00:01"},
                 "ipConfig": {}}
            ]
        }))
        .unwrap();

        let record = NodeRecord::from_vm(&vm, &credentials());
        assert_eq!(record.name, "node1");
        assert_eq!(record.cpu, "2");
        assert_eq!(record.memory, "8192");
        assert_eq!(record.disk, "60");
        assert_eq!(record.mac, vec!["2c:c2:60:00:00:01"]);
        assert_eq!(record.pm_type, "pxe_ssh");
        assert_eq!(record.pm_addr, "localhost");
    }

    #[test]
    fn test_file_round_trip_and_mac_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let vm: Vm = serde_json::from_value(serde_json::json!({
            "name": "node1",
            "networkConnections": [
                {"name": "eth0",
                 "device": {"index": 0, "deviceType": "virtio", "mac": "2c:c2:60:00:00:01"},
                 "ipConfig": {}}
            ]
        }))
        .unwrap();
        let file = NodesFile {
            nodes: vec![NodeRecord::from_vm(&vm, &credentials())],
        };
        file.save(&path).unwrap();

        let loaded = NodesFile::load(&path).unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(
            loaded.macs_for("node1").unwrap(),
            &["2c:c2:60:00:00:01".to_string()]
        );
        assert!(loaded.macs_for("node9").is_none());
    }
}
