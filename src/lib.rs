mod error;
mod memory;
mod monitor;
mod process;
mod qemu;
mod qmp;
mod settings;
mod vm;

pub use error::{Error, Result};
pub use memory::MemorySize;
pub use monitor::VmStatusMonitor;
pub use process::{
    MonitoredProcess, ProcessError, ProcessErrorKind, ProcessOutput, ProcessState, RunningProcess,
};
pub use qemu::{
    LinuxQemuPlatform, QemuBinaries, QemuPlatform, QemuVirtualMachine, QemuVmFactory, SUSPEND_TAG,
};
pub use qmp::{QmpEvent, QmpSession, QMP_COMMAND_TIMEOUT};
pub use settings::{InstanceSettingsHandler, SETTINGS_ROOT};
pub use vm::{
    ImageSpec, NetworkInterface, VirtualMachineDescription, VmSpecs, VmState, UNKNOWN_IP_ADDRESS,
};
