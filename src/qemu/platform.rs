use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::MonitoredProcess;
use crate::vm::VirtualMachineDescription;

const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Host-side resource manager for the QEMU backend.
///
/// Owns everything the hypervisor process needs from the host: tap devices,
/// DHCP leases, per-VM argument fragments. One platform adapter is shared by
/// every VM of the backend and injected at construction.
pub trait QemuPlatform: Send + Sync {
    /// Extra argv fragments for a VM process: networking, acceleration,
    /// display suppression.
    fn vm_platform_args(&self, desc: &VirtualMachineDescription) -> Vec<String>;

    /// Argv for `-dump-vmstate` probing. May be empty.
    fn vmstate_platform_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// The current DHCP lease for a MAC address, if one is known.
    fn get_ip_for(&self, mac: &str) -> Option<String>;

    /// Release the tap device and host state held for a VM. Idempotent.
    fn remove_resources_for(&self, vm_name: &str);

    /// Errors if the host is unfit to run this backend.
    fn platform_health_check(&self) -> Result<()>;

    /// Suggested sub-directory under the data root for this backend's files.
    fn get_directory_name(&self) -> String {
        String::new()
    }
}

/// The Linux host implementation: KVM acceleration, per-VM tap devices and a
/// dnsmasq lease file under the backend data directory.
pub struct LinuxQemuPlatform {
    data_dir: PathBuf,
    kvm_device: PathBuf,
    tun_device: PathBuf,
    apparmor_enabled: bool,
}

impl LinuxQemuPlatform {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        // DISABLE_APPARMOR=1 skips profile application to spawned QEMU
        let apparmor_enabled = std::env::var_os("DISABLE_APPARMOR").is_none();
        if !apparmor_enabled {
            info!(target: "qemuctl", "platform: apparmor disabled by environment");
        }
        Self {
            data_dir: data_dir.into(),
            kvm_device: PathBuf::from("/dev/kvm"),
            tun_device: PathBuf::from("/dev/net/tun"),
            apparmor_enabled,
        }
    }

    #[cfg(test)]
    fn with_devices(data_dir: impl Into<PathBuf>, kvm: impl Into<PathBuf>, tun: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            kvm_device: kvm.into(),
            tun_device: tun.into(),
            apparmor_enabled: false,
        }
    }

    pub fn apparmor_enabled(&self) -> bool {
        self.apparmor_enabled
    }

    /// Stable per-VM tap device name, short enough for IFNAMSIZ.
    pub fn tap_device_name(vm_name: &str) -> String {
        let mut hasher = DefaultHasher::new();
        vm_name.hash(&mut hasher);
        format!("tap-{:08x}", hasher.finish() as u32)
    }

    fn leases_path(&self) -> PathBuf {
        self.data_dir.join("dnsmasq.leases")
    }
}

impl QemuPlatform for LinuxQemuPlatform {
    fn vm_platform_args(&self, desc: &VirtualMachineDescription) -> Vec<String> {
        let tap = Self::tap_device_name(&desc.vm_name);
        let mut args = vec![
            "-accel".to_string(),
            "kvm".to_string(),
            "-cpu".to_string(),
            "host".to_string(),
            "-nic".to_string(),
            format!(
                "tap,ifname={},script=no,downscript=no,model=virtio-net-pci,mac={}",
                tap, desc.default_mac
            ),
        ];
        for (index, iface) in desc.extra_interfaces.iter().enumerate() {
            args.push("-nic".to_string());
            args.push(format!(
                "tap,ifname={}-{},script=no,downscript=no,model=virtio-net-pci,mac={}",
                tap, index, iface.mac_address
            ));
        }
        args
    }

    fn get_ip_for(&self, mac: &str) -> Option<String> {
        let leases = self.leases_path();
        let contents = match fs::read_to_string(&leases) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(
                    target: "qemuctl",
                    "platform: no leases at {}: {}",
                    leases.display(),
                    err
                );
                return None;
            }
        };

        // dnsmasq lease lines: <expiry> <mac> <ip> <hostname> <client-id>
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let _expiry = fields.next();
            let Some(lease_mac) = fields.next() else {
                continue;
            };
            let Some(ip) = fields.next() else {
                continue;
            };
            if lease_mac.eq_ignore_ascii_case(mac) {
                return Some(ip.to_string());
            }
        }
        None
    }

    fn remove_resources_for(&self, vm_name: &str) {
        let tap = Self::tap_device_name(vm_name);
        debug!(target: "qemuctl", "platform: removing tap device {}", tap);
        let output = MonitoredProcess::new(
            "ip",
            vec!["tuntap".into(), "del".into(), "dev".into(), tap.clone(), "mode".into(), "tap".into()],
        )
        .execute(HOST_COMMAND_TIMEOUT);
        if !output.state.completed_successfully() {
            debug!(
                target: "qemuctl",
                "platform: ignoring ip tuntap del {}: {}",
                tap,
                output.state.describe()
            );
        }
    }

    fn platform_health_check(&self) -> Result<()> {
        for device in [&self.kvm_device, &self.tun_device] {
            let metadata = fs::metadata(device).map_err(|source| Error::Io {
                path: device.clone(),
                source,
            })?;
            if metadata.permissions().readonly() {
                warn!(
                    target: "qemuctl",
                    "platform: {} is read-only",
                    device.display()
                );
            }
        }
        Ok(())
    }

    fn get_directory_name(&self) -> String {
        "qemu".to_string()
    }
}
