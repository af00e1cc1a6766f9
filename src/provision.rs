//! Node provisioning: draft new VMs and publish them in one batch.
//!
//! A new node is a clone of the template node's network shape with fresh
//! addresses, plus drives sized from the request. Nodes are appended to
//! the design document and persisted with a single end-of-batch write
//! and publish, so a partially built batch is never visible remotely.

use anyhow::Context;
use tracing::{debug, info};

use crate::address::{address_step, allocate_next, subnet_addresses, subnet_of};
use crate::api::models::{
    Device, DriveType, HardDrive, IpConfig, NetworkConnection, SizeValue, StaticIpConfig,
    SuppliedService, Vm,
};
use crate::api::{Application, ApplicationApi};
use crate::power::ensure_min_runtime;
use crate::retry::AttemptState;
use crate::Error;

/// Seconds the backend waits for a guest to shut down cleanly.
const STOP_TIMEOUT_SECS: u64 = 180;

/// Requested shape of the new nodes.
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec {
    /// Number of CPUs per node.
    pub cpus: u32,
    /// Memory per node in MB.
    pub memory_mb: u64,
    /// Disk size per node in GB.
    pub disk_gb: u64,
    /// How many nodes to create in this batch.
    pub count: u32,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 8192,
            disk_gb: 60,
            count: 1,
        }
    }
}

/// First `{prefix}{n}` (n >= 1) not present in `existing`.
#[must_use]
pub fn unique_name(prefix: &str, existing: &[String]) -> String {
    let mut n = 1;
    loop {
        let candidate = format!("{prefix}{n}");
        if !existing.iter().any(|name| *name == candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Build one draft node from the template.
///
/// Every template interface is cloned onto the same subnet with a newly
/// allocated address; addresses already drafted for earlier nodes in the
/// batch count as taken because `app` is scanned in both scopes.
///
/// # Errors
/// Fails when a template interface has no static IP or its subnet has no
/// free address left.
pub fn build_node(
    app: &Application,
    template: &Vm,
    name: &str,
    spec: NodeSpec,
    step: u32,
    iso_image_id: Option<u64>,
) -> Result<Vm, Error> {
    let mut connections = Vec::with_capacity(template.network_connections.len());

    for conn in &template.network_connections {
        let scfg = conn
            .static_ip()
            .ok_or_else(|| Error::MissingStaticIp(conn.name.clone()))?;
        let subnet = subnet_of(scfg.ip, scfg.mask);
        let existing = subnet_addresses(app, subnet, scfg.mask);
        let new_ip = allocate_next(&existing, subnet, scfg.mask, step)?;
        debug!(node = name, interface = %conn.name, ip = %new_ip, "Allocated address");

        connections.push(NetworkConnection {
            name: conn.name.clone(),
            device: Device {
                index: conn.device.index,
                device_type: conn.device.device_type.clone(),
                use_automatic_mac: Some(true),
                mac: None,
                extra: Default::default(),
            },
            ip_config: IpConfig {
                has_public_ip: conn.ip_config.has_public_ip,
                external_access_state: conn.ip_config.external_access_state.clone(),
                static_ip_config: Some(StaticIpConfig {
                    ip: new_ip,
                    mask: scfg.mask,
                    extra: scfg.extra.clone(),
                }),
                extra: Default::default(),
            },
            extra: Default::default(),
        });
    }

    let hard_drives = vec![
        HardDrive {
            index: 1,
            drive_type: DriveType::Disk,
            name: "sda".to_string(),
            boot: true,
            controller: Some("virtio".to_string()),
            size: Some(SizeValue::gb(spec.disk_gb)),
            base_disk_image_id: None,
            extra: Default::default(),
        },
        HardDrive {
            index: 2,
            drive_type: DriveType::Cdrom,
            name: "cdrom".to_string(),
            boot: false,
            controller: Some("IDE".to_string()),
            size: None,
            base_disk_image_id: iso_image_id,
            extra: Default::default(),
        },
    ];

    // New nodes are reached over ssh on their first interface.
    let first_ip = connections
        .first()
        .and_then(NetworkConnection::static_ip)
        .map(|scfg| scfg.ip)
        .ok_or_else(|| Error::MissingStaticIp(name.to_string()))?;
    let supplied_services = vec![SuppliedService {
        name: "ssh".to_string(),
        port_range: "22".to_string(),
        protocol: "TCP".to_string(),
        external: true,
        ip: first_ip,
        extra: Default::default(),
    }];

    let mut extra = serde_json::Map::new();
    extra.insert("description".into(), "Node created by cloudnode.".into());
    extra.insert("baseVmId".into(), 0.into());
    extra.insert("stopTimeOut".into(), STOP_TIMEOUT_SECS.into());

    Ok(Vm {
        id: None,
        name: name.to_string(),
        state: None,
        num_cpus: Some(spec.cpus),
        memory_size: Some(SizeValue::mb(spec.memory_mb)),
        hard_drives,
        network_connections: connections,
        supplied_services,
        extra,
    })
}

/// Drafts nodes into an application and publishes them as one batch.
pub struct Provisioner<'a> {
    api: &'a dyn ApplicationApi,
    /// Minimum remaining runtime required before publishing.
    min_runtime: std::time::Duration,
    /// Base image attached to each node's CDROM drive, if configured.
    iso_image_id: Option<u64>,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        api: &'a dyn ApplicationApi,
        min_runtime: std::time::Duration,
        iso_image_id: Option<u64>,
    ) -> Self {
        Self {
            api,
            min_runtime,
            iso_image_id,
        }
    }

    /// Create `spec.count` nodes and publish the batch.
    ///
    /// Returns the names of the created nodes.
    ///
    /// # Errors
    /// Fails on address exhaustion, a missing template, or a remote
    /// fault during the final write or publish.
    pub async fn create_nodes(
        &self,
        state: &mut AttemptState,
        spec: NodeSpec,
    ) -> anyhow::Result<Vec<String>> {
        let template = state.app.template_node()?.clone();
        let step = address_step(spec.count);

        let mut names: Vec<String> = state
            .app
            .design
            .vms
            .iter()
            .chain(state.app.deployment.vms.iter())
            .map(|vm| vm.name.clone())
            .collect();

        let mut created = Vec::with_capacity(spec.count as usize);
        for _ in 0..spec.count {
            let name = unique_name("node", &names);
            let node = build_node(&state.app, &template, &name, spec, step, self.iso_image_id)?;
            state.app.design.vms.push(node);
            names.push(name.clone());
            created.push(name);
        }

        ensure_min_runtime(self.api, self.min_runtime, state).await?;

        // One write and one publish for the whole batch; draft VMs stay
        // powered off until explicitly started.
        self.api
            .update_application(&state.app)
            .await
            .context("failed to write application draft")?;
        self.api
            .publish_updates(state.app.id, Some(false))
            .await
            .context("failed to publish updates")?;

        info!(count = created.len(), nodes = ?created, "Created nodes");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn two_subnet_app() -> Application {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "stack",
            "design": {"vms": [{
                "name": "template",
                "networkConnections": [
                    {
                        "name": "eth0",
                        "device": {"index": 0, "deviceType": "virtio"},
                        "ipConfig": {
                            "hasPublicIp": false,
                            "externalAccessState": "CONDITIONAL_PUBLIC_IP",
                            "staticIpConfig": {"ip": "10.0.0.5", "mask": "255.255.255.0"}
                        }
                    },
                    {
                        "name": "eth1",
                        "device": {"index": 1, "deviceType": "virtio"},
                        "ipConfig": {
                            "staticIpConfig": {"ip": "192.168.1.9", "mask": "255.255.255.0"}
                        }
                    }
                ]
            }]}
        }))
        .unwrap()
    }

    #[test]
    fn test_unique_name() {
        let existing = vec!["template".to_string(), "node1".to_string()];
        assert_eq!(unique_name("node", &existing), "node2");
        assert_eq!(unique_name("node", &[]), "node1");
    }

    #[test]
    fn test_build_node_allocates_on_each_subnet() {
        // Single-node batch uses step 10: 10.0.0.5 -> .15, 192.168.1.9 -> .19.
        let app = two_subnet_app();
        let template = app.template_node().unwrap().clone();
        let node = build_node(&app, &template, "node1", NodeSpec::default(), 10, None).unwrap();

        let ips: Vec<Ipv4Addr> = node
            .network_connections
            .iter()
            .map(|c| c.static_ip().unwrap().ip)
            .collect();
        assert_eq!(
            ips,
            vec![
                "10.0.0.15".parse::<Ipv4Addr>().unwrap(),
                "192.168.1.19".parse::<Ipv4Addr>().unwrap()
            ]
        );

        // Shape cloned from the template, MAC left to the backend.
        let eth0 = &node.network_connections[0];
        assert_eq!(eth0.name, "eth0");
        assert_eq!(eth0.device.use_automatic_mac, Some(true));
        assert_eq!(eth0.ip_config.has_public_ip, Some(false));

        // ssh on the first interface's new address.
        assert_eq!(node.supplied_services.len(), 1);
        let ssh = &node.supplied_services[0];
        assert_eq!(ssh.name, "ssh");
        assert_eq!(ssh.port_range, "22");
        assert_eq!(ssh.ip, "10.0.0.15".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_build_node_drives() {
        let app = two_subnet_app();
        let template = app.template_node().unwrap().clone();
        let spec = NodeSpec {
            cpus: 4,
            memory_mb: 4096,
            disk_gb: 40,
            count: 1,
        };
        let node = build_node(&app, &template, "node1", spec, 10, Some(77)).unwrap();

        assert_eq!(node.num_cpus, Some(4));
        assert_eq!(node.memory_size, Some(SizeValue::mb(4096)));

        let disk = node.boot_disk().unwrap();
        assert!(disk.boot);
        assert_eq!(disk.size, Some(SizeValue::gb(40)));
        assert_eq!(disk.controller.as_deref(), Some("virtio"));

        let cdrom = node
            .hard_drives
            .iter()
            .find(|d| d.drive_type == DriveType::Cdrom)
            .unwrap();
        assert_eq!(cdrom.base_disk_image_id, Some(77));
    }

    #[test]
    fn test_batch_drafts_interleave_sequentially() {
        // A multi-node batch steps by 1 and each draft sees its
        // predecessors' addresses as taken.
        let mut app = two_subnet_app();
        let template = app.template_node().unwrap().clone();

        for name in ["node1", "node2"] {
            let node = build_node(&app, &template, name, NodeSpec::default(), 1, None).unwrap();
            app.design.vms.push(node);
        }

        let ip_of = |name: &str| {
            app.design
                .vms
                .iter()
                .find(|vm| vm.name == name)
                .unwrap()
                .network_connections[0]
                .static_ip()
                .unwrap()
                .ip
        };
        assert_eq!(ip_of("node1"), "10.0.0.6".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip_of("node2"), "10.0.0.7".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_build_node_requires_static_ip() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "stack",
            "design": {"vms": [{
                "name": "template",
                "networkConnections": [{
                    "name": "eth0",
                    "device": {"index": 0, "deviceType": "virtio"},
                    "ipConfig": {}
                }]
            }]}
        }))
        .unwrap();
        let template = app.template_node().unwrap().clone();

        let err = build_node(&app, &template, "node1", NodeSpec::default(), 10, None).unwrap_err();
        assert!(matches!(err, Error::MissingStaticIp(name) if name == "eth0"));
    }
}
