use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::memory::MemorySize;

/// Sentinel returned by `management_ipv4` when no DHCP lease is known.
pub const UNKNOWN_IP_ADDRESS: &str = "UNKNOWN";

/// Observable lifecycle state of a virtual machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    #[default]
    Off,
    Stopped,
    Starting,
    Restarting,
    Running,
    DelayedShutdown,
    Suspending,
    Suspended,
    Unknown,
}

impl VmState {
    /// States in which an instance may be reconfigured (resize, settings).
    pub fn is_stopped(self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped)
    }
}

/// One guest network interface beyond the default one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub mac_address: String,
    pub auto_mode: bool,
}

/// The boot image a VM is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image_path: PathBuf,
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub stream: String,
}

/// Everything needed to construct a VM. Immutable for the VM's lifetime,
/// except for the resizable shape fields which only ever grow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualMachineDescription {
    pub num_cores: u32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub vm_name: String,
    pub ssh_username: String,
    pub image: ImageSpec,
    pub cloud_init_iso: PathBuf,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub default_mac: String,
}

/// The authoritative live shape of an instance, as persisted by the daemon
/// layer. `num_cores`, `mem_size` and `disk_space` are monotonically
/// non-decreasing across the instance's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmSpecs {
    pub num_cores: u32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub default_mac: String,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    #[serde(default)]
    pub state: VmState,
    #[serde(default)]
    pub mounts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
