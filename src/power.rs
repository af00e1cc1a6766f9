//! Power control for managed nodes.
//!
//! The provisioning manager's power model is simpler than the backend's:
//! it knows on/off/reboot, while the backend exposes six lifecycle
//! states and mutates them asynchronously. [`classify`] maps an
//! (action, observed state) pair to a decision; [`PowerManager`] runs
//! that decision under the retry engine, re-fetching the snapshot on
//! every retried attempt because another actor may have moved the VM in
//! the meantime.

use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::api::models::AppScope;
use crate::api::{Application, ApplicationApi, VmAction, VmState};
use crate::retry::{self, AttemptError, AttemptState, RetryError, RetryPolicy};
use crate::Error;

/// Deadline for one power command, including all retries.
const POWER_DEADLINE_SECS: u64 = 1200;

/// Retries allowed per contended-write status (400/403/409).
const CONTENDED_RETRIES: u32 = 3;

/// A power action requested by the provisioning manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Reboot,
    SetBootDevice,
}

/// What to do about an action given the observed VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to issue; the backend converges on its own.
    Noop,
    /// Transient state; re-evaluate after a refresh.
    Retry,
    /// Issue the given power verb against the VM.
    Power(VmAction),
    /// Rewrite the design document and publish it.
    Publish,
}

/// The drive a node boots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    /// Boot from the local disk ("hd").
    Disk,
    /// Boot from the network ("network").
    Network,
}

impl FromStr for BootDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hd" => Ok(Self::Disk),
            "network" => Ok(Self::Network),
            _ => Err(Error::InvalidBootDevice(s.to_string())),
        }
    }
}

impl std::fmt::Display for BootDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disk => write!(f, "hd"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Decide what `action` means for a VM observed in `state`.
///
/// The transient states (STARTING, STOPPING, RESTARTING) are never safe
/// to mutate. A "start" on a STARTED VM power-cycles it: that is the
/// contract the provisioning manager expects. UPDATING is entered only
/// as a side effect of a boot-device change; the backend restarts the VM
/// itself, so "start" treats it as already done, while "stop" and
/// "reboot" must wait the update out.
#[must_use]
pub fn classify(action: PowerAction, state: VmState) -> Decision {
    use VmState::{Restarting, Started, Starting, Stopped, Stopping, Updating};

    match action {
        PowerAction::Start => match state {
            Started => Decision::Power(VmAction::Restart),
            Stopped => Decision::Power(VmAction::Start),
            Updating => Decision::Noop,
            Starting | Stopping | Restarting => Decision::Retry,
        },
        PowerAction::Stop => match state {
            Started => Decision::Power(VmAction::Poweroff),
            Stopping | Stopped => Decision::Noop,
            Starting | Restarting | Updating => Decision::Retry,
        },
        PowerAction::Reboot => match state {
            Started | Stopped => Decision::Power(VmAction::Restart),
            Starting | Stopping | Restarting | Updating => Decision::Retry,
        },
        PowerAction::SetBootDevice => match state {
            Started | Stopped | Updating => Decision::Publish,
            Starting | Stopping | Restarting => Decision::Retry,
        },
    }
}

/// Policy for power commands: contended writes (400/403/409) are retried
/// a few times; everything else is fatal on first sight.
#[must_use]
pub fn power_policy() -> RetryPolicy {
    RetryPolicy::new()
        .with_deadline(Duration::from_secs(POWER_DEADLINE_SECS))
        .retry_status(400, CONTENDED_RETRIES)
        .retry_status(403, CONTENDED_RETRIES)
        .retry_status(409, CONTENDED_RETRIES)
}

/// Read the configured boot device of a node.
///
/// # Errors
/// Returns an error if the node or its DISK drive is missing.
pub fn boot_device(app: &Application, node: &str) -> Result<BootDevice, Error> {
    let vm = app.vm_by_name(AppScope::Deployment, node)?;
    let disk = vm.boot_disk()?;
    Ok(if disk.boot {
        BootDevice::Disk
    } else {
        BootDevice::Network
    })
}

/// Executes power actions against one application.
pub struct PowerManager<'a> {
    api: &'a dyn ApplicationApi,
    policy: RetryPolicy,
    /// Minimum remaining runtime required before acting on a VM.
    min_runtime: Duration,
}

impl<'a> PowerManager<'a> {
    /// Create a manager with the standard contended-write policy.
    pub fn new(api: &'a dyn ApplicationApi, min_runtime: Duration) -> Self {
        Self {
            api,
            policy: power_policy(),
            min_runtime,
        }
    }

    /// Override the retry policy (tests use short deadlines).
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start a node. Power-cycles it when it is already running.
    ///
    /// # Errors
    /// Propagates timeouts, unbudgeted API faults, and unknown nodes.
    pub async fn start(&self, state: &mut AttemptState, node: &str) -> Result<(), RetryError> {
        self.ensure_min_runtime(state).await?;
        self.run_action(state, node, PowerAction::Start).await
    }

    /// Stop a node. A node already stopped or stopping is left alone.
    ///
    /// # Errors
    /// Propagates timeouts, unbudgeted API faults, and unknown nodes.
    pub async fn stop(&self, state: &mut AttemptState, node: &str) -> Result<(), RetryError> {
        self.ensure_min_runtime(state).await?;
        self.run_action(state, node, PowerAction::Stop).await
    }

    /// Reboot a node.
    ///
    /// # Errors
    /// Propagates timeouts, unbudgeted API faults, and unknown nodes.
    pub async fn reboot(&self, state: &mut AttemptState, node: &str) -> Result<(), RetryError> {
        self.ensure_min_runtime(state).await?;
        self.run_action(state, node, PowerAction::Reboot).await
    }

    /// Set the boot device of a node.
    ///
    /// The boot flag lives in the design document, so this rewrites the
    /// whole application and then publishes. The publish runs under its
    /// own retry budget: it is independent of the VM's state.
    ///
    /// # Errors
    /// Propagates timeouts, unbudgeted API faults, and unknown nodes.
    pub async fn set_boot_device(
        &self,
        state: &mut AttemptState,
        node: &str,
        device: BootDevice,
    ) -> Result<(), RetryError> {
        debug!(node, device = %device, "Setting boot device");
        let api = self.api;

        retry::run(&self.policy, "set boot device", state, async |st| {
            if st.is_retry() {
                st.app = api.get_application(st.app.id).await?;
            }
            let vm = st.app.vm_by_name(AppScope::Deployment, node)?;
            let vm_state = observed_state(vm)?;
            debug!(node, state = %vm_state, "Observed VM state");

            match classify(PowerAction::SetBootDevice, vm_state) {
                Decision::Retry => {
                    Err(AttemptError::Busy(format!("node `{node}` in state `{vm_state}`")))
                }
                _ => {
                    let disk = st.app.design_vm_mut(node)?.boot_disk_mut()?;
                    disk.boot = device == BootDevice::Disk;
                    api.update_application(&st.app).await?;
                    Ok(())
                }
            }
        })
        .await?;

        retry::run(&RetryPolicy::new(), "publish updates", state, async |st| {
            api.publish_updates(st.app.id, None).await?;
            Ok(())
        })
        .await
    }

    /// Run a start/stop/reboot decision loop.
    async fn run_action(
        &self,
        state: &mut AttemptState,
        node: &str,
        action: PowerAction,
    ) -> Result<(), RetryError> {
        debug!(node, ?action, "Running power action");
        let api = self.api;

        retry::run(&self.policy, "power action", state, async |st| {
            // Another actor may have changed the power state since the
            // last attempt; work from a fresh snapshot on retries.
            if st.is_retry() {
                st.app = api.get_application(st.app.id).await?;
            }
            let vm = st.app.vm_by_name(AppScope::Deployment, node)?;
            let vm_state = observed_state(vm)?;
            debug!(node, state = %vm_state, "Observed VM state");

            match classify(action, vm_state) {
                Decision::Noop => Ok(()),
                Decision::Retry => {
                    Err(AttemptError::Busy(format!("node `{node}` in state `{vm_state}`")))
                }
                Decision::Power(verb) => {
                    let vm_id = vm.id.ok_or_else(|| Error::NoVmId(node.to_string()))?;
                    api.vm_action(st.app.id, vm_id, verb).await?;
                    Ok(())
                }
                Decision::Publish => unreachable!("publish decisions only for set-boot-device"),
            }
        })
        .await
    }

    /// See [`ensure_min_runtime`].
    async fn ensure_min_runtime(&self, state: &mut AttemptState) -> Result<(), RetryError> {
        ensure_min_runtime(self.api, self.min_runtime, state).await
    }
}

/// Extend the application expiration when it is sooner than the minimum
/// runtime. Must run before acting on a VM: an expiring application can
/// be torn down mid-action. The call is retried under its own policy
/// because it succeeds regardless of VM state.
///
/// # Errors
/// Propagates API faults from the expiration call.
pub async fn ensure_min_runtime(
    api: &dyn ApplicationApi,
    min_runtime: Duration,
    state: &mut AttemptState,
) -> Result<(), RetryError> {
    let Some(next_stop_ms) = state.app.next_stop_time else {
        return Ok(());
    };
    let min_runtime_ms = i64::try_from(min_runtime.as_millis()).unwrap_or(i64::MAX);
    if next_stop_ms >= chrono::Utc::now().timestamp_millis() + min_runtime_ms {
        return Ok(());
    }

    debug!(
        next_stop_ms,
        min_runtime_secs = min_runtime.as_secs(),
        "Expiration sooner than minimum runtime, extending"
    );
    let seconds = min_runtime.as_secs();

    retry::run(&RetryPolicy::new(), "extend expiration", state, async |st| {
        api.set_expiration(st.app.id, seconds).await?;
        Ok(())
    })
    .await
}

/// The lifecycle state of a deployment VM.
fn observed_state(vm: &crate::api::Vm) -> Result<VmState, AttemptError> {
    vm.state
        .ok_or_else(|| Error::NoVmState(vm.name.clone()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table_exhaustive() {
        use Decision::{Noop, Power, Publish, Retry};
        use PowerAction::{Reboot, SetBootDevice, Start, Stop};
        use VmState::{Restarting, Started, Starting, Stopped, Stopping, Updating};

        // Full transition table, one row per (action, state) pair. The
        // UPDATING rows depend on the backend restarting a VM by itself
        // after a boot-device change.
        let table = [
            (Start, Starting, Retry),
            (Start, Started, Power(VmAction::Restart)),
            (Start, Stopping, Retry),
            (Start, Stopped, Power(VmAction::Start)),
            (Start, Restarting, Retry),
            (Start, Updating, Noop),
            (Stop, Starting, Retry),
            (Stop, Started, Power(VmAction::Poweroff)),
            (Stop, Stopping, Noop),
            (Stop, Stopped, Noop),
            (Stop, Restarting, Retry),
            (Stop, Updating, Retry),
            (Reboot, Starting, Retry),
            (Reboot, Started, Power(VmAction::Restart)),
            (Reboot, Stopping, Retry),
            (Reboot, Stopped, Power(VmAction::Restart)),
            (Reboot, Restarting, Retry),
            (Reboot, Updating, Retry),
            (SetBootDevice, Starting, Retry),
            (SetBootDevice, Started, Publish),
            (SetBootDevice, Stopping, Retry),
            (SetBootDevice, Stopped, Publish),
            (SetBootDevice, Restarting, Retry),
            (SetBootDevice, Updating, Publish),
        ];

        for (action, state, expected) in table {
            assert_eq!(
                classify(action, state),
                expected,
                "classify({action:?}, {state:?})"
            );
        }
    }

    #[test]
    fn test_boot_device_parse_and_display() {
        assert_eq!("hd".parse::<BootDevice>().unwrap(), BootDevice::Disk);
        assert_eq!("network".parse::<BootDevice>().unwrap(), BootDevice::Network);
        assert!("cdrom".parse::<BootDevice>().is_err());
        assert_eq!(BootDevice::Disk.to_string(), "hd");
        assert_eq!(BootDevice::Network.to_string(), "network");
    }

    #[test]
    fn test_boot_device_from_app() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "stack",
            "deployment": {"vms": [
                {"name": "template"},
                {"name": "node1", "state": "STOPPED", "hardDrives": [
                    {"index": 1, "type": "DISK", "name": "sda", "boot": true}
                ]},
                {"name": "node2", "state": "STOPPED", "hardDrives": [
                    {"index": 1, "type": "DISK", "name": "sda", "boot": false},
                    {"index": 2, "type": "CDROM", "name": "cdrom"}
                ]}
            ]}
        }))
        .unwrap();

        assert_eq!(boot_device(&app, "node1").unwrap(), BootDevice::Disk);
        assert_eq!(boot_device(&app, "node2").unwrap(), BootDevice::Network);
    }

    #[test]
    fn test_power_policy_budget() {
        let policy = power_policy();
        assert!(policy.consume(400).is_some());
        assert!(policy.consume(403).is_some());
        assert!(policy.consume(409).is_some());
        assert!(policy.consume(500).is_none());
        assert_eq!(policy.deadline, Duration::from_secs(1200));
    }
}
