mod factory;
mod machine;
mod platform;

#[cfg(test)]
pub(crate) mod testing;

pub use factory::QemuVmFactory;
pub use machine::{QemuBinaries, QemuVirtualMachine, SUSPEND_TAG};
pub use platform::{LinuxQemuPlatform, QemuPlatform};
