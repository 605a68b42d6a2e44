use serde_json::Value;

use crate::vm::VmState;

/// Persistence hook and event sink for VM state transitions.
///
/// Implemented by the daemon layer; every VM holds a shared reference and
/// the monitor must outlive it. `persist_state_for` is invoked under the
/// VM's state mutex, so implementations must not call back into the VM.
pub trait VmStatusMonitor: Send + Sync {
    /// Record a state transition. Called for every transition, in order.
    fn persist_state_for(&self, name: &str, state: VmState);

    /// Metadata previously stored for this VM, read once at start. Returns a
    /// JSON object; unrecognized keys are preserved opaquely.
    fn retrieve_metadata_for(&self, name: &str) -> Value;

    /// Replace the stored metadata for this VM.
    fn update_metadata_for(&self, name: &str, metadata: Value);

    /// The VM reached the running state.
    fn on_resume(&self);

    /// The VM reached `off` through a non-suspend path.
    fn on_shutdown(&self);

    /// The VM was successfully suspended to disk.
    fn on_suspend(&self);
}
