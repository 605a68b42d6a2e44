//! End-to-end lifecycle over the public API, with a scripted stand-in
//! hypervisor and in-memory daemon collaborators.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;

use qemuctl::{
    ImageSpec, InstanceSettingsHandler, QemuBinaries, QemuPlatform, QemuVmFactory,
    VirtualMachineDescription, VmSpecs, VmState, VmStatusMonitor,
};

const FAKE_QEMU: &str = r#"
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
      echo '{"timestamp": {"seconds": 1541188930, "microseconds": 0}, "event": "SHUTDOWN"}'
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

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[derive(Default)]
struct RecordingMonitor {
    states: Mutex<Vec<VmState>>,
    resumes: Mutex<usize>,
    shutdowns: Mutex<usize>,
    suspends: Mutex<usize>,
}

impl VmStatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _name: &str, state: VmState) {
        self.states.lock().unwrap().push(state);
    }

    fn retrieve_metadata_for(&self, _name: &str) -> Value {
        Value::Null
    }

    fn update_metadata_for(&self, _name: &str, _metadata: Value) {}

    fn on_resume(&self) {
        *self.resumes.lock().unwrap() += 1;
    }

    fn on_shutdown(&self) {
        *self.shutdowns.lock().unwrap() += 1;
    }

    fn on_suspend(&self) {
        *self.suspends.lock().unwrap() += 1;
    }
}

struct LoopbackPlatform;

impl QemuPlatform for LoopbackPlatform {
    fn vm_platform_args(&self, _desc: &VirtualMachineDescription) -> Vec<String> {
        Vec::new()
    }

    fn get_ip_for(&self, _mac: &str) -> Option<String> {
        Some("192.168.64.2".to_string())
    }

    fn remove_resources_for(&self, _vm_name: &str) {}

    fn platform_health_check(&self) -> qemuctl::Result<()> {
        Ok(())
    }

    fn get_directory_name(&self) -> String {
        "qemu".to_string()
    }
}

fn description(temp: &TempDir) -> VirtualMachineDescription {
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
        image: ImageSpec {
            image_path: image,
            ..Default::default()
        },
        cloud_init_iso: iso,
        extra_interfaces: Vec::new(),
        default_mac: "52:54:00:11:22:33".to_string(),
    }
}

fn factory(temp: &TempDir) -> QemuVmFactory {
    QemuVmFactory::with_platform(temp.path(), Arc::new(LoopbackPlatform))
        .with_binaries(QemuBinaries {
            qemu_system: write_script(temp.path(), "qemu-system", FAKE_QEMU),
            qemu_img: write_script(temp.path(), "qemu-img", "exit 0\n"),
        })
}

#[test]
fn full_lifecycle_start_suspend_resume_shutdown() {
    let temp = TempDir::new().unwrap();
    let monitor = Arc::new(RecordingMonitor::default());
    let machine = factory(&temp)
        .create_virtual_machine(description(&temp), Arc::clone(&monitor) as Arc<dyn VmStatusMonitor>)
        .unwrap();

    assert_eq!(machine.current_state(), VmState::Off);

    machine.start().unwrap();
    machine.ensure_vm_is_running().unwrap();
    assert_eq!(machine.current_state(), VmState::Running);
    assert_eq!(
        machine.ssh_hostname(std::time::Duration::from_secs(1)).unwrap(),
        "192.168.64.2"
    );

    machine.suspend().unwrap();
    assert_eq!(machine.current_state(), VmState::Off);

    machine.start().unwrap();
    machine.ensure_vm_is_running().unwrap();
    machine.shutdown().unwrap();
    assert_eq!(machine.current_state(), VmState::Off);

    assert_eq!(*monitor.resumes.lock().unwrap(), 2);
    assert_eq!(*monitor.suspends.lock().unwrap(), 1);
    assert_eq!(*monitor.shutdowns.lock().unwrap(), 1);

    // persisted states walk the lifecycle graph, in order
    let states = monitor.states.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![
            VmState::Starting,
            VmState::Running,
            VmState::Suspending,
            VmState::Off,
            VmState::Starting,
            VmState::Running,
            VmState::Off,
        ]
    );
}

#[test]
fn settings_handler_grows_a_stopped_instance() {
    let temp = TempDir::new().unwrap();
    let monitor = Arc::new(RecordingMonitor::default());
    let machine = factory(&temp)
        .create_virtual_machine(description(&temp), Arc::clone(&monitor) as Arc<dyn VmStatusMonitor>)
        .unwrap();

    let specs = Arc::new(dashmap::DashMap::new());
    specs.insert(
        machine.name().to_string(),
        VmSpecs {
            num_cores: 2,
            mem_size: "3M".parse().unwrap(),
            disk_space: "5G".parse().unwrap(),
            ..Default::default()
        },
    );
    let instances = Arc::new(dashmap::DashMap::new());
    instances.insert(machine.name().to_string(), Arc::clone(&machine));

    let handler = InstanceSettingsHandler::new(
        Arc::clone(&specs),
        instances,
        Arc::new(dashmap::DashSet::new()),
        Arc::new(dashmap::DashSet::new()),
        || {},
    );

    handler.set("local.pied-piper-valley.cpus", "4").unwrap();
    handler.set("local.pied-piper-valley.memory", "1G").unwrap();
    assert_eq!(handler.get("local.pied-piper-valley.cpus").unwrap(), "4");
    assert_eq!(
        handler.get("local.pied-piper-valley.memory").unwrap(),
        format!("{} bytes", 1024u64 * 1024 * 1024)
    );
}

#[test]
fn backend_queries_answer_without_a_vm() {
    let temp = TempDir::new().unwrap();
    let factory = factory(&temp);

    assert_eq!(factory.get_backend_directory_name(), "qemu");
    assert!(factory.hypervisor_health_check().is_ok());
    assert!(factory.networks().is_err());
    // the stand-in hypervisor has no version banner
    assert_eq!(factory.get_backend_version_string(), "qemu-unknown");
}
