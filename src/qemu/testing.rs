//! Shared doubles for backend tests: stub hypervisor scripts, a recording
//! status monitor and a scriptable platform adapter.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

use crate::monitor::VmStatusMonitor;
use crate::vm::{VirtualMachineDescription, VmState};

use super::machine::{QemuBinaries, QemuVirtualMachine};
use super::platform::QemuPlatform;

/// A stand-in `qemu-system` that speaks just enough QMP for the lifecycle:
/// greets, acks capabilities, reports paused vCPUs until `cont` resumes
/// them, powers down on request and snapshots on `savevm`.
pub(crate) const FAKE_QEMU: &str = r#"
echo '{"QMP": {"version": {"qemu": {"major": 8, "minor": 2}}, "capabilities": []}}'
while read line; do
  case "$line" in
    *qmp_capabilities*)
      echo '{"return": {}}'
      ;;
    *query-status*)
      echo '{"return": {"status": "prelaunch", "running": false}}'
      ;;
    *\"cont\"*)
      echo '{"return": {}}'
      echo '{"timestamp": {"seconds": 1541188919, "microseconds": 838498}, "event": "RESUME"}'
      ;;
    *system_powerdown*)
      echo '{"return": {}}'
      echo '{"timestamp": {"seconds": 1541188930, "microseconds": 0}, "event": "POWERDOWN"}'
      echo '{"timestamp": {"seconds": 1541188931, "microseconds": 0}, "event": "SHUTDOWN"}'
      exit 0
      ;;
    *savevm*)
      echo '{"return": {}}'
      echo '{"timestamp": {"seconds": 1541188940, "microseconds": 0}, "event": "RESUME"}'
      ;;
    *) echo '{"return": {}}' ;;
  esac
done
"#;

/// Completes the handshake but never reports the guest as resumed, leaving
/// the machine parked in `starting`.
pub(crate) const STARTING_FOREVER_QEMU: &str = r#"
echo '{"QMP": {"version": {}, "capabilities": []}}'
while read line; do
  echo '{"return": {}}'
done
"#;

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A `qemu-img` whose `snapshot -l` output carries the suspend tag.
pub(crate) fn fake_qemu_img_with_snapshot(temp: &TempDir) -> PathBuf {
    write_script(
        temp.path(),
        "qemu-img",
        "echo '1 suspend 512M 2024-01-01 00:00:00'\nexit 0\n",
    )
}

pub(crate) fn description(temp: &TempDir) -> VirtualMachineDescription {
    let image = temp.path().join("instance.qcow2");
    let iso = temp.path().join("cloud-init.iso");
    fs::write(&image, b"qcow2").unwrap();
    fs::write(&iso, b"iso").unwrap();
    VirtualMachineDescription {
        num_cores: 2,
        mem_size: "3M".parse().unwrap(),
        disk_space: "5G".parse().unwrap(),
        vm_name: "pied-piper-valley".to_string(),
        ssh_username: "ubuntu".to_string(),
        image: crate::vm::ImageSpec {
            image_path: image,
            ..Default::default()
        },
        cloud_init_iso: iso,
        extra_interfaces: Vec::new(),
        default_mac: "52:54:00:11:22:33".to_string(),
    }
}

/// Build a machine over a stub hypervisor script. Without an explicit
/// `qemu_img`, the snapshot probe points at a nonexistent binary and reads
/// as "no snapshot".
pub(crate) fn machine_with(
    temp: &TempDir,
    qemu_body: &str,
    qemu_img: Option<PathBuf>,
    metadata: Option<Value>,
) -> (QemuVirtualMachine, Arc<RecordingMonitor>, Arc<StubPlatform>) {
    let qemu_system = write_script(temp.path(), "qemu-system", qemu_body);
    let binaries = QemuBinaries {
        qemu_system,
        qemu_img: qemu_img.unwrap_or_else(|| temp.path().join("no-such-qemu-img")),
    };
    let monitor = Arc::new(match metadata {
        Some(metadata) => RecordingMonitor::with_metadata(metadata),
        None => RecordingMonitor::default(),
    });
    let platform = Arc::new(StubPlatform::default());
    let machine = QemuVirtualMachine::new(
        description(temp),
        Arc::clone(&platform) as Arc<dyn QemuPlatform>,
        Arc::clone(&monitor) as Arc<dyn VmStatusMonitor>,
        binaries,
    );
    (machine, monitor, platform)
}

pub(crate) fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    Persist(VmState),
    Resume,
    Shutdown,
    Suspend,
    MetadataUpdate(Value),
}

#[derive(Default)]
pub(crate) struct RecordingMonitor {
    observed: Mutex<Vec<Observed>>,
    metadata: Mutex<Value>,
}

impl RecordingMonitor {
    pub(crate) fn with_metadata(metadata: Value) -> Self {
        Self {
            observed: Mutex::new(Vec::new()),
            metadata: Mutex::new(metadata),
        }
    }

    pub(crate) fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }
}

impl VmStatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _name: &str, state: VmState) {
        self.observed.lock().unwrap().push(Observed::Persist(state));
    }

    fn retrieve_metadata_for(&self, _name: &str) -> Value {
        self.metadata.lock().unwrap().clone()
    }

    fn update_metadata_for(&self, _name: &str, metadata: Value) {
        self.observed
            .lock()
            .unwrap()
            .push(Observed::MetadataUpdate(metadata));
    }

    fn on_resume(&self) {
        self.observed.lock().unwrap().push(Observed::Resume);
    }

    fn on_shutdown(&self) {
        self.observed.lock().unwrap().push(Observed::Shutdown);
    }

    fn on_suspend(&self) {
        self.observed.lock().unwrap().push(Observed::Suspend);
    }
}

#[derive(Default)]
pub(crate) struct StubPlatform {
    ip: Mutex<Option<String>>,
    removed: Mutex<Vec<String>>,
    health_error: Mutex<Option<String>>,
}

impl StubPlatform {
    pub(crate) fn set_ip(&self, ip: Option<&str>) {
        *self.ip.lock().unwrap() = ip.map(String::from);
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub(crate) fn set_health_error(&self, message: &str) {
        *self.health_error.lock().unwrap() = Some(message.to_string());
    }
}

impl QemuPlatform for StubPlatform {
    fn vm_platform_args(&self, _desc: &VirtualMachineDescription) -> Vec<String> {
        Vec::new()
    }

    fn get_ip_for(&self, _mac: &str) -> Option<String> {
        self.ip.lock().unwrap().clone()
    }

    fn remove_resources_for(&self, vm_name: &str) {
        self.removed.lock().unwrap().push(vm_name.to_string());
    }

    fn platform_health_check(&self) -> crate::error::Result<()> {
        match self.health_error.lock().unwrap().as_ref() {
            Some(message) => Err(crate::error::Error::Io {
                path: PathBuf::from("/dev/kvm"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
            }),
            None => Ok(()),
        }
    }

    fn get_directory_name(&self) -> String {
        "qemu".to_string()
    }
}
