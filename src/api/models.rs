//! Data model for the cloud application API.
//!
//! An application is an opaque JSON document owned by the remote backend.
//! We read it as a snapshot, mutate the parts we understand, and write the
//! whole document back with `PUT`. Every struct therefore carries a
//! flattened passthrough map so fields this model does not know about
//! survive a read-modify-write cycle.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Extra fields preserved across a read-modify-write cycle.
pub type Extra = serde_json::Map<String, Value>;

/// VM lifecycle state as reported by the backend.
///
/// Transitions are driven exclusively by the backend; we never assign a
/// state locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    /// VM is powering on.
    Starting,
    /// VM is up and running.
    Started,
    /// VM is powering off.
    Stopping,
    /// VM is powered off.
    Stopped,
    /// VM is restarting.
    Restarting,
    /// VM is applying a published design change (e.g. boot device).
    Updating,
}

impl VmState {
    /// Whether the VM counts as powered on for listing purposes.
    #[must_use]
    pub fn is_running(self) -> bool {
        !matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Started => write!(f, "STARTED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Restarting => write!(f, "RESTARTING"),
            Self::Updating => write!(f, "UPDATING"),
        }
    }
}

/// Which half of the application document to look at.
///
/// `deployment` is the live state; `design` is the draft that a
/// `publishUpdates` call commits to the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppScope {
    /// Live, running VMs with lifecycle state.
    Deployment,
    /// Draft VMs pending publication.
    Design,
}

/// A size with an explicit unit ("MB" or "GB").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeValue {
    pub value: u64,
    pub unit: String,
}

impl SizeValue {
    /// Create a size in megabytes.
    #[must_use]
    pub fn mb(value: u64) -> Self {
        Self {
            value,
            unit: "MB".to_string(),
        }
    }

    /// Create a size in gigabytes.
    #[must_use]
    pub fn gb(value: u64) -> Self {
        Self {
            value,
            unit: "GB".to_string(),
        }
    }

    /// Value expressed in megabytes.
    #[must_use]
    pub fn in_mb(&self) -> u64 {
        match self.unit.as_str() {
            "GB" => self.value * 1024,
            "KB" => self.value / 1024,
            _ => self.value,
        }
    }

    /// Value expressed in gigabytes.
    #[must_use]
    pub fn in_gb(&self) -> u64 {
        match self.unit.as_str() {
            "MB" => self.value / 1024,
            _ => self.value,
        }
    }
}

/// Hard drive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveType {
    #[serde(rename = "DISK")]
    Disk,
    #[serde(rename = "CDROM")]
    Cdrom,
}

/// A VM hard drive. Exactly one DISK drive per VM is the boot candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardDrive {
    pub index: u32,
    #[serde(rename = "type")]
    pub drive_type: DriveType,
    pub name: String,
    /// Whether this drive is configured to boot.
    #[serde(default)]
    pub boot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_disk_image_id: Option<u64>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A NIC device descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub index: u32,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_automatic_mac: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Static IP configuration of a network connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    #[serde(flatten)]
    pub extra: Extra,
}

/// IP configuration of a network connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_public_ip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_access_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_ip_config: Option<StaticIpConfig>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A VM network connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConnection {
    pub name: String,
    pub device: Device,
    pub ip_config: IpConfig,
    #[serde(flatten)]
    pub extra: Extra,
}

impl NetworkConnection {
    /// The MAC address for this connection, if one is assigned.
    #[must_use]
    pub fn mac(&self) -> Option<&str> {
        self.device.mac.as_deref()
    }

    /// The static IP assigned to this connection, if any.
    #[must_use]
    pub fn static_ip(&self) -> Option<&StaticIpConfig> {
        self.ip_config.static_ip_config.as_ref()
    }
}

/// An inbound service declaration (e.g. ssh on port 22).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppliedService {
    pub name: String,
    pub port_range: String,
    pub protocol: String,
    pub external: bool,
    pub ip: Ipv4Addr,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A virtual machine within an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// Backend-assigned id. Absent on freshly drafted design VMs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    /// Lifecycle state; only deployment-scope VMs carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<VmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<SizeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_drives: Vec<HardDrive>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_connections: Vec<NetworkConnection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplied_services: Vec<SuppliedService>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Vm {
    /// The DISK drive of this VM.
    ///
    /// # Errors
    /// Returns [`Error::NoDisk`] if the VM has no DISK drive.
    pub fn boot_disk(&self) -> Result<&HardDrive, Error> {
        self.hard_drives
            .iter()
            .find(|d| d.drive_type == DriveType::Disk)
            .ok_or_else(|| Error::NoDisk(self.name.clone()))
    }

    /// Mutable access to the DISK drive of this VM.
    ///
    /// # Errors
    /// Returns [`Error::NoDisk`] if the VM has no DISK drive.
    pub fn boot_disk_mut(&mut self) -> Result<&mut HardDrive, Error> {
        let name = self.name.clone();
        self.hard_drives
            .iter_mut()
            .find(|d| d.drive_type == DriveType::Disk)
            .ok_or(Error::NoDisk(name))
    }

    /// All MAC addresses assigned to this VM's connections.
    #[must_use]
    pub fn macs(&self) -> Vec<String> {
        self.network_connections
            .iter()
            .filter_map(|c| c.mac().map(str::to_string))
            .collect()
    }
}

/// One half (design or deployment) of an application document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmCollection {
    #[serde(default)]
    pub vms: Vec<Vm>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Summary entry from the application list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub id: u64,
    pub name: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Full application snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub design: VmCollection,
    #[serde(default)]
    pub deployment: VmCollection,
    /// Scheduled stop time in epoch milliseconds, if an expiration is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stop_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Application {
    /// VMs in the given scope.
    #[must_use]
    pub fn vms(&self, scope: AppScope) -> &[Vm] {
        match scope {
            AppScope::Deployment => &self.deployment.vms,
            AppScope::Design => &self.design.vms,
        }
    }

    /// Look up a VM by name in the given scope.
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] if no VM has that name.
    pub fn vm_by_name(&self, scope: AppScope, name: &str) -> Result<&Vm, Error> {
        self.vms(scope)
            .iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// Mutable lookup of a VM by name in the design scope.
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] if no VM has that name.
    pub fn design_vm_mut(&mut self, name: &str) -> Result<&mut Vm, Error> {
        self.design
            .vms
            .iter_mut()
            .find(|vm| vm.name == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// The managed nodes: every deployment VM except the template (first).
    #[must_use]
    pub fn managed_nodes(&self) -> &[Vm] {
        if self.deployment.vms.is_empty() {
            &[]
        } else {
            &self.deployment.vms[1..]
        }
    }

    /// The template node whose interfaces new nodes clone.
    ///
    /// # Errors
    /// Returns [`Error::NoTemplateNode`] if the design scope is empty.
    pub fn template_node(&self) -> Result<&Vm, Error> {
        self.design
            .vms
            .first()
            .ok_or_else(|| Error::NoTemplateNode(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_running() {
        assert!(VmState::Started.is_running());
        assert!(VmState::Updating.is_running());
        assert!(!VmState::Stopped.is_running());
        assert!(!VmState::Stopping.is_running());
    }

    #[test]
    fn test_size_conversion() {
        assert_eq!(SizeValue::gb(4).in_mb(), 4096);
        assert_eq!(SizeValue::mb(8192).in_gb(), 8);
        assert_eq!(SizeValue::mb(512).in_mb(), 512);
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        // PUT replaces the whole snapshot, so fields we don't model must
        // survive deserialize -> serialize.
        let doc = serde_json::json!({
            "id": 42,
            "name": "stack",
            "owner": "someone-else",
            "design": {
                "vms": [{
                    "name": "node1",
                    "loadingStatus": "DONE",
                    "hardDrives": [{
                        "index": 1,
                        "type": "DISK",
                        "name": "sda",
                        "boot": true,
                        "peripheralType": "virtio"
                    }]
                }],
                "network": {"subnets": []}
            }
        });

        let app: Application = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(app.extra.get("owner").unwrap(), "someone-else");

        let back = serde_json::to_value(&app).unwrap();
        assert_eq!(back.get("owner").unwrap(), "someone-else");
        assert_eq!(
            back["design"]["vms"][0]["loadingStatus"],
            serde_json::json!("DONE")
        );
        assert_eq!(
            back["design"]["vms"][0]["hardDrives"][0]["peripheralType"],
            serde_json::json!("virtio")
        );
        assert!(back["design"]["network"].is_object());
    }

    #[test]
    fn test_vm_lookup_by_name() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "stack",
            "deployment": {"vms": [
                {"id": 10, "name": "template", "state": "STARTED"},
                {"id": 11, "name": "node1", "state": "STOPPED"}
            ]}
        }))
        .unwrap();

        let vm = app.vm_by_name(AppScope::Deployment, "node1").unwrap();
        assert_eq!(vm.id, Some(11));
        assert_eq!(vm.state, Some(VmState::Stopped));

        let err = app.vm_by_name(AppScope::Deployment, "node9").unwrap_err();
        assert!(matches!(err, Error::UnknownNode(name) if name == "node9"));
    }

    #[test]
    fn test_managed_nodes_skip_template() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "stack",
            "deployment": {"vms": [
                {"name": "template"},
                {"name": "node1"},
                {"name": "node2"}
            ]}
        }))
        .unwrap();

        let names: Vec<_> = app.managed_nodes().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["node1", "node2"]);
    }
}
