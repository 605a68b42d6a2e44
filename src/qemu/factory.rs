use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::monitor::VmStatusMonitor;
use crate::process::MonitoredProcess;
use crate::vm::VirtualMachineDescription;

use super::machine::{QemuBinaries, QemuVirtualMachine, PROBE_TIMEOUT};
use super::platform::{LinuxQemuPlatform, QemuPlatform};

/// Builds QEMU-backed VMs and answers backend-level queries.
///
/// All VMs share the factory's platform adapter; per-VM state lives under
/// `<data_dir>/<backend_dir>/<vm_name>/`.
pub struct QemuVmFactory {
    data_dir: PathBuf,
    platform: Arc<dyn QemuPlatform>,
    binaries: QemuBinaries,
}

impl QemuVmFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let platform = Arc::new(LinuxQemuPlatform::new(data_dir.clone()));
        Self::with_platform(data_dir, platform)
    }

    /// Inject a custom platform adapter (other hosts, tests).
    pub fn with_platform(data_dir: impl Into<PathBuf>, platform: Arc<dyn QemuPlatform>) -> Self {
        Self {
            data_dir: data_dir.into(),
            platform,
            binaries: QemuBinaries::default(),
        }
    }

    /// Override the hypervisor binary paths.
    pub fn with_binaries(mut self, binaries: QemuBinaries) -> Self {
        self.binaries = binaries;
        self
    }

    pub fn create_virtual_machine(
        &self,
        desc: VirtualMachineDescription,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Arc<QemuVirtualMachine>> {
        let vm_dir = self.instance_directory(&desc.vm_name);
        fs::create_dir_all(&vm_dir).map_err(|source| Error::Io {
            path: vm_dir.clone(),
            source,
        })?;
        info!(
            target: "qemuctl",
            "factory: creating instance {} under {}",
            desc.vm_name,
            vm_dir.display()
        );
        Ok(Arc::new(QemuVirtualMachine::new(
            desc,
            Arc::clone(&self.platform),
            monitor,
            self.binaries.clone(),
        )))
    }

    /// Release host resources and the state directory of a (possibly gone)
    /// instance. Idempotent.
    pub fn remove_resources_for(&self, name: &str) {
        self.platform.remove_resources_for(name);
        let vm_dir = self.instance_directory(name);
        match fs::remove_dir_all(&vm_dir) {
            Ok(()) => debug!(
                target: "qemuctl",
                "factory: removed state dir {}",
                vm_dir.display()
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target: "qemuctl",
                "factory: failed removing {}: {}",
                vm_dir.display(),
                err
            ),
        }
    }

    pub fn hypervisor_health_check(&self) -> Result<()> {
        self.platform.platform_health_check()?;
        self.probe_vmstate();
        Ok(())
    }

    pub fn get_backend_directory_name(&self) -> String {
        self.platform.get_directory_name()
    }

    /// `"qemu-<x.y.z>"` from `qemu-system-<arch> --version`, or
    /// `"qemu-unknown"` when the probe fails or its output is unparsable.
    pub fn get_backend_version_string(&self) -> String {
        let output = MonitoredProcess::new(&self.binaries.qemu_system, vec!["--version".into()])
            .execute(PROBE_TIMEOUT);
        if !output.state.completed_successfully() {
            warn!(
                target: "qemuctl",
                "factory: version probe failed ({})",
                output.state.describe()
            );
            return "qemu-unknown".to_string();
        }
        match parse_qemu_version(&output.stdout_utf8()) {
            Some(version) => format!("qemu-{}", version),
            None => {
                warn!(
                    target: "qemuctl",
                    "factory: unparsable version output: {}",
                    output.stdout_utf8().trim()
                );
                "qemu-unknown".to_string()
            }
        }
    }

    /// Extra bridged networks are not supported by this backend.
    pub fn networks(&self) -> Result<Vec<String>> {
        Err(Error::NotImplementedOnThisBackend)
    }

    fn instance_directory(&self, name: &str) -> PathBuf {
        let backend_dir = self.platform.get_directory_name();
        if backend_dir.is_empty() {
            self.data_dir.join(name)
        } else {
            self.data_dir.join(backend_dir).join(name)
        }
    }

    // -dump-vmstate writes a JSON description of the migration format; a
    // failure only means suspend compatibility cannot be checked up front.
    fn probe_vmstate(&self) {
        let dump_path = self.data_dir.join("vmstate.json");
        let mut args = self.platform.vmstate_platform_args();
        args.push("-dump-vmstate".to_string());
        args.push(dump_path.display().to_string());
        let output = MonitoredProcess::new(&self.binaries.qemu_system, args).execute(PROBE_TIMEOUT);
        if output.state.completed_successfully() {
            debug!(target: "qemuctl", "factory: vmstate probe succeeded");
        } else {
            warn!(
                target: "qemuctl",
                "factory: vmstate probe failed ({})",
                output.state.describe()
            );
        }
        let _ = fs::remove_file(&dump_path);
    }
}

/// First line matching `QEMU emulator version <x.y[.z]>`, digits only.
fn parse_qemu_version(output: &str) -> Option<String> {
    const MARKER: &str = "QEMU emulator version ";
    output.lines().find_map(|line| {
        let start = line.find(MARKER)? + MARKER.len();
        let rest = &line[start..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let version = rest[..end].trim_end_matches('.');
        let parts: Vec<&str> = version.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return None;
        }
        if parts
            .iter()
            .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
        {
            return None;
        }
        Some(version.to_string())
    })
}
