use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::MemorySize;
use crate::monitor::VmStatusMonitor;
use crate::process::{MonitoredProcess, RunningProcess};
use crate::qmp::{QmpEvent, QmpSession, QMP_COMMAND_TIMEOUT};
use crate::vm::{VirtualMachineDescription, VmState, UNKNOWN_IP_ADDRESS};

use super::platform::QemuPlatform;

/// qemu-img snapshot tag marking an image that holds a suspended VM.
pub const SUSPEND_TAG: &str = "suspend";

/// Timeout for short-lived helper invocations (qemu-img, version probes).
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a powered-down instance gets to exit before being killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for the child to disappear after a forced kill.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

const IP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Paths to the hypervisor binaries. Injected so tests (and unusual hosts)
/// can substitute their own; the defaults resolve through `$PATH`.
#[derive(Debug, Clone)]
pub struct QemuBinaries {
    pub qemu_system: PathBuf,
    pub qemu_img: PathBuf,
}

impl Default for QemuBinaries {
    fn default() -> Self {
        Self {
            qemu_system: PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            qemu_img: PathBuf::from("qemu-img"),
        }
    }
}

#[derive(Default)]
struct MachineState {
    state: VmState,
    process: Option<Arc<RunningProcess>>,
    qmp: Option<Arc<QmpSession>>,
    has_suspend_snapshot: bool,
    start_failure: Option<String>,
    last_spawn_args: Vec<String>,
    metadata: Value,
}

struct MachineInner {
    name: String,
    desc: Mutex<VirtualMachineDescription>,
    binaries: QemuBinaries,
    platform: Arc<dyn QemuPlatform>,
    monitor: Arc<dyn VmStatusMonitor>,
    lock: Mutex<MachineState>,
    state_changed: Condvar,
}

impl MachineInner {
    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.lock.lock().expect("poisoned vm state mutex")
    }

    /// The single funnel for state transitions: persists through the monitor
    /// and wakes every waiter. Must be called with the state guard held.
    fn set_state(&self, st: &mut MachineState, new_state: VmState) {
        if st.state == new_state {
            return;
        }
        debug!(
            target: "qemuctl",
            "state: instance {} {:?} -> {:?}",
            self.name,
            st.state,
            new_state
        );
        st.state = new_state;
        self.monitor.persist_state_for(&self.name, new_state);
        self.state_changed.notify_all();
    }
}

/// A single QEMU-backed virtual machine.
///
/// Owns its supervised process and QMP session for that process' lifetime.
/// All observable state lives behind one mutex; blocking operations wait on
/// the paired condition variable and are released by state transitions.
pub struct QemuVirtualMachine {
    inner: Arc<MachineInner>,
}

impl QemuVirtualMachine {
    pub(crate) fn new(
        desc: VirtualMachineDescription,
        platform: Arc<dyn QemuPlatform>,
        monitor: Arc<dyn VmStatusMonitor>,
        binaries: QemuBinaries,
    ) -> Self {
        let has_snapshot = image_has_suspend_snapshot(&binaries.qemu_img, &desc.image.image_path);
        let name = desc.vm_name.clone();
        Self {
            inner: Arc::new(MachineInner {
                name,
                desc: Mutex::new(desc),
                binaries,
                platform,
                monitor,
                lock: Mutex::new(MachineState {
                    has_suspend_snapshot: has_snapshot,
                    ..Default::default()
                }),
                state_changed: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Observed state; never blocks beyond the mutex.
    pub fn current_state(&self) -> VmState {
        self.inner.lock().state
    }

    /// Launch QEMU and transition to `starting`. Idempotent while the VM is
    /// already starting or running.
    pub fn start(&self) -> Result<()> {
        let metadata = self.inner.monitor.retrieve_metadata_for(&self.inner.name);

        let mut st = self.inner.lock();
        match st.state {
            VmState::Running
            | VmState::Starting
            | VmState::Restarting
            | VmState::DelayedShutdown => {
                debug!(target: "qemuctl", "start: instance {} already underway", self.inner.name);
                return Ok(());
            }
            VmState::Suspending => {
                return Err(Error::StartFailure {
                    name: self.inner.name.clone(),
                    reason: "a suspend is still in progress".to_string(),
                });
            }
            // the hypervisor may still be alive underneath an unknown state;
            // a second spawn over the same image would corrupt it
            VmState::Unknown => {
                return Err(Error::StartFailure {
                    name: self.inner.name.clone(),
                    reason: "instance is in an unknown state; shut it down first".to_string(),
                });
            }
            VmState::Off | VmState::Stopped | VmState::Suspended => {}
        }

        let desc = self
            .inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .clone();
        let resuming = st.has_suspend_snapshot;
        let args = assemble_arguments(&desc, &metadata, resuming, self.inner.platform.as_ref());

        info!(
            target: "qemuctl",
            "start: launching {} for instance {} (resuming: {})",
            self.inner.binaries.qemu_system.display(),
            self.inner.name,
            resuming
        );

        let process = MonitoredProcess::new(&self.inner.binaries.qemu_system, args.clone())
            .start()
            .map_err(|err| Error::StartFailure {
                name: self.inner.name.clone(),
                reason: format!("launching hypervisor: {}", err),
            })?;
        let process = Arc::new(process);
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();

        st.process = Some(Arc::clone(&process));
        st.qmp = None;
        st.start_failure = None;
        st.last_spawn_args = args;
        st.metadata = metadata;
        self.inner.set_state(&mut st, VmState::Starting);
        drop(st);

        self.spawn_exit_watcher(Arc::clone(&process));

        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(self.fail_start(&process, "hypervisor stdio unavailable")),
        };

        match QmpSession::establish(stdin, stdout) {
            Ok(session) => {
                let session = Arc::new(session);
                let mut st = self.inner.lock();
                let ours = st
                    .process
                    .as_ref()
                    .map_or(false, |p| Arc::ptr_eq(p, &process));
                if !ours || st.state != VmState::Starting {
                    // a concurrent shutdown won the race; it already cleaned up
                    return Ok(());
                }
                if let Some(events) = session.take_events() {
                    self.spawn_event_dispatcher(events, Arc::clone(&process));
                }
                st.qmp = Some(Arc::clone(&session));
                drop(st);
                self.kick_paused_vcpus(&session);
                Ok(())
            }
            Err(err) => Err(self.fail_start(&process, &format!("qmp handshake failed: {}", err))),
        }
    }

    /// Power the instance down. A no-op when it is already off or suspended;
    /// while `starting` this is the cancellation channel (see
    /// `ensure_vm_is_running`).
    pub fn shutdown(&self) -> Result<()> {
        let mut st = self.inner.lock();
        match st.state {
            VmState::Off | VmState::Stopped | VmState::Suspended => {
                debug!(
                    target: "qemuctl",
                    "shutdown: instance {} is not running, nothing to do",
                    self.inner.name
                );
                return Ok(());
            }
            VmState::Suspending => {
                warn!(
                    target: "qemuctl",
                    "shutdown: ignoring request while instance {} is suspending",
                    self.inner.name
                );
                return Ok(());
            }
            VmState::Starting => {
                info!(
                    target: "qemuctl",
                    "shutdown: instance {} was still starting, interrupting",
                    self.inner.name
                );
                let mut reason = "instance shutdown requested while it was starting".to_string();
                if let Some(process) = st.process.take() {
                    process.kill();
                    process.wait();
                    let stderr = process.read_all_standard_error();
                    if !stderr.trim().is_empty() {
                        reason = format!("{}: {}", reason, stderr.trim());
                    }
                }
                st.start_failure = Some(reason);
                st.qmp = None;
                self.inner.set_state(&mut st, VmState::Off);
                return Ok(());
            }
            VmState::Running
            | VmState::Restarting
            | VmState::DelayedShutdown
            | VmState::Unknown => {}
        }

        let qmp = st.qmp.clone();
        let process = st.process.clone();
        if qmp.is_none() && process.is_none() {
            // nothing supervised; the state alone flips
            self.inner.monitor.on_shutdown();
            self.inner.set_state(&mut st, VmState::Off);
            return Ok(());
        }
        drop(st);

        let powered_down = match &qmp {
            Some(qmp) => match qmp.execute_command("system_powerdown") {
                Ok(_) => true,
                Err(err) => {
                    warn!(
                        target: "qemuctl",
                        "shutdown: system_powerdown for {} failed ({}), killing",
                        self.inner.name,
                        err
                    );
                    false
                }
            },
            None => false,
        };
        if !powered_down {
            if let Some(process) = &process {
                process.kill();
            }
        }

        let st = self.inner.lock();
        let (st, reached) = self.wait_for_off(st, Instant::now() + SHUTDOWN_TIMEOUT);
        if !reached {
            warn!(
                target: "qemuctl",
                "shutdown: instance {} ignored powerdown, killing",
                self.inner.name
            );
            if let Some(process) = st.process.clone() {
                process.kill();
            }
            let (_st, reached) = self.wait_for_off(st, Instant::now() + KILL_TIMEOUT);
            if !reached {
                return Err(Error::Timeout {
                    operation: format!("waiting for instance {} to power down", self.inner.name),
                });
            }
        }
        Ok(())
    }

    /// Snapshot the VM into its image (`savevm suspend`), then stop the
    /// process. The image carries the suspend tag afterwards and the next
    /// `start` resumes from it.
    pub fn suspend(&self) -> Result<()> {
        let mut st = self.inner.lock();
        match st.state {
            VmState::Running | VmState::DelayedShutdown => {}
            VmState::Off | VmState::Stopped if st.has_suspend_snapshot => {
                debug!(
                    target: "qemuctl",
                    "suspend: instance {} is already suspended",
                    self.inner.name
                );
                return Ok(());
            }
            other => {
                info!(
                    target: "qemuctl",
                    "suspend: ignoring request for instance {} in state {:?}",
                    self.inner.name,
                    other
                );
                return Ok(());
            }
        }

        let qmp = match st.qmp.clone() {
            Some(qmp) => qmp,
            None => {
                return Err(Error::QmpChannel(format!(
                    "no qmp session for instance {}",
                    self.inner.name
                )))
            }
        };
        self.inner.set_state(&mut st, VmState::Suspending);
        drop(st);

        if let Err(err) = qmp.human_monitor_command(&format!("savevm {}", SUSPEND_TAG)) {
            warn!(
                target: "qemuctl",
                "suspend: savevm for {} failed ({}), killing",
                self.inner.name,
                err
            );
            let mut st = self.inner.lock();
            if let Some(process) = st.process.take() {
                process.kill();
            }
            st.qmp = None;
            self.inner.monitor.on_shutdown();
            self.inner.set_state(&mut st, VmState::Off);
            return Err(err);
        }

        // the RESUME event completes the suspend on the dispatch thread
        let st = self.inner.lock();
        let (_st, reached) = self.wait_for_off(st, Instant::now() + QMP_COMMAND_TIMEOUT);
        if !reached {
            return Err(Error::Timeout {
                operation: format!("waiting for instance {} to finish suspending", self.inner.name),
            });
        }
        Ok(())
    }

    /// Block until the VM is running, or fail with the recorded start
    /// failure if it fell back to `off` (or ended up `unknown`) on the way.
    pub fn ensure_vm_is_running(&self) -> Result<()> {
        let mut st = self.inner.lock();
        loop {
            match st.state {
                VmState::Running | VmState::DelayedShutdown => return Ok(()),
                VmState::Off | VmState::Stopped | VmState::Suspended => {
                    let reason = st
                        .start_failure
                        .clone()
                        .unwrap_or_else(|| "instance failed to start".to_string());
                    return Err(Error::StartFailure {
                        name: self.inner.name.clone(),
                        reason,
                    });
                }
                VmState::Unknown => {
                    return Err(Error::StartFailure {
                        name: self.inner.name.clone(),
                        reason: "instance state became unknown while starting".to_string(),
                    });
                }
                VmState::Starting | VmState::Restarting | VmState::Suspending => {
                    st = self
                        .inner
                        .state_changed
                        .wait(st)
                        .expect("poisoned vm state mutex");
                }
            }
        }
    }

    /// The management IP once a lease shows up, within `timeout`. On expiry
    /// the state degrades to `unknown` and a timeout error is returned.
    pub fn ssh_hostname(&self, timeout: Duration) -> Result<String> {
        let mac = self
            .inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .default_mac
            .clone();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ip) = self.inner.platform.get_ip_for(&mac) {
                return Ok(ip);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    target: "qemuctl",
                    "ssh_hostname: no lease for instance {} within {:?}",
                    self.inner.name,
                    timeout
                );
                let mut st = self.inner.lock();
                self.inner.set_state(&mut st, VmState::Unknown);
                return Err(Error::Timeout {
                    operation: format!(
                        "waiting for an IP address for instance {}",
                        self.inner.name
                    ),
                });
            }
            thread::sleep(IP_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// The management IP, or the `"UNKNOWN"` sentinel when no lease exists.
    pub fn management_ipv4(&self) -> String {
        let mac = self
            .inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .default_mac
            .clone();
        self.inner
            .platform
            .get_ip_for(&mac)
            .unwrap_or_else(|| UNKNOWN_IP_ADDRESS.to_string())
    }

    pub fn update_cpus(&self, num_cores: u32) -> Result<()> {
        let st = self.inner.lock();
        self.require_stopped(st.state, "update CPUs")?;
        self.inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .num_cores = num_cores;
        Ok(())
    }

    pub fn resize_memory(&self, size: MemorySize) -> Result<()> {
        let st = self.inner.lock();
        self.require_stopped(st.state, "resize memory")?;
        self.inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .mem_size = size;
        Ok(())
    }

    /// Grow the backing image via `qemu-img resize`, then record the new
    /// size in the description.
    pub fn resize_disk(&self, size: MemorySize) -> Result<()> {
        let st = self.inner.lock();
        self.require_stopped(st.state, "resize disk")?;

        let image = self
            .inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .image
            .image_path
            .clone();
        if let Some(current) = image_virtual_size(&self.inner.binaries.qemu_img, &image) {
            if size.in_bytes() < current {
                return Err(Error::InstanceSettings {
                    operation: "Cannot resize disk".to_string(),
                    instance: self.inner.name.clone(),
                    reason: "Disk can only be expanded".to_string(),
                });
            }
        }
        let output = MonitoredProcess::new(
            &self.inner.binaries.qemu_img,
            vec![
                "resize".to_string(),
                image.display().to_string(),
                size.in_bytes().to_string(),
            ],
        )
        .execute(PROBE_TIMEOUT);
        if !output.state.completed_successfully() {
            return Err(Error::Io {
                path: image,
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "qemu-img resize failed ({}): {}",
                        output.state.describe(),
                        output.stderr_utf8().trim()
                    ),
                ),
            });
        }

        self.inner
            .desc
            .lock()
            .expect("poisoned vm description mutex")
            .disk_space = size;
        Ok(())
    }

    /// Extra bridged networks are not supported by this backend.
    pub fn networks(&self) -> Result<Vec<String>> {
        Err(Error::NotImplementedOnThisBackend)
    }

    /// A guest restored with `-loadvm` comes up with its vCPUs paused;
    /// `cont` resumes them and makes QEMU announce RESUME.
    fn kick_paused_vcpus(&self, session: &QmpSession) {
        match session.execute_command("query-status") {
            Ok(reply) => {
                if reply["return"]["running"] == false {
                    if let Err(err) = session.execute_command("cont") {
                        warn!(
                            target: "qemuctl",
                            "start: cont for instance {} failed: {}",
                            self.inner.name,
                            err
                        );
                    }
                }
            }
            Err(err) => warn!(
                target: "qemuctl",
                "start: query-status for instance {} failed: {}",
                self.inner.name,
                err
            ),
        }
    }

    fn require_stopped(&self, state: VmState, operation: &str) -> Result<()> {
        if state.is_stopped() {
            Ok(())
        } else {
            Err(Error::InstanceSettings {
                operation: format!("Cannot {}", operation),
                instance: self.inner.name.clone(),
                reason: "Instance must be stopped for modification".to_string(),
            })
        }
    }

    fn fail_start(&self, process: &Arc<RunningProcess>, reason: &str) -> Error {
        let mut st = self.inner.lock();
        let ours = st
            .process
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, process));
        let reason = if ours {
            process.kill();
            process.wait();
            let stderr = process.read_all_standard_error();
            let reason = if stderr.trim().is_empty() {
                reason.to_string()
            } else {
                format!("{}: {}", reason, stderr.trim())
            };
            st.process = None;
            st.qmp = None;
            st.start_failure = Some(reason.clone());
            self.inner.set_state(&mut st, VmState::Off);
            reason
        } else {
            // the exit watcher or a concurrent shutdown got here first
            st.start_failure.clone().unwrap_or_else(|| reason.to_string())
        };
        Error::StartFailure {
            name: self.inner.name.clone(),
            reason,
        }
    }

    fn wait_for_off<'a>(
        &self,
        mut st: MutexGuard<'a, MachineState>,
        deadline: Instant,
    ) -> (MutexGuard<'a, MachineState>, bool) {
        while st.state != VmState::Off {
            let now = Instant::now();
            if now >= deadline {
                return (st, false);
            }
            let (guard, _timeout) = self
                .inner
                .state_changed
                .wait_timeout(st, deadline - now)
                .expect("poisoned vm state mutex");
            st = guard;
        }
        (st, true)
    }

    fn spawn_exit_watcher(&self, process: Arc<RunningProcess>) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let exit = process.wait();
            let mut st = inner.lock();
            let ours = st
                .process
                .as_ref()
                .map_or(false, |p| Arc::ptr_eq(p, &process));
            if !ours {
                debug!(
                    target: "qemuctl",
                    "exit_watcher: stale process for instance {} ({})",
                    inner.name,
                    exit.describe()
                );
                return;
            }
            st.process = None;
            st.qmp = None;
            match st.state {
                VmState::Starting => {
                    let stderr = process.read_all_standard_error();
                    let mut reason =
                        format!("instance exited while starting ({})", exit.describe());
                    if !stderr.trim().is_empty() {
                        reason = format!("{}: {}", reason, stderr.trim());
                    }
                    warn!(target: "qemuctl", "exit_watcher: {}: {}", inner.name, reason);
                    st.start_failure = Some(reason);
                    inner.set_state(&mut st, VmState::Off);
                }
                VmState::Off | VmState::Stopped | VmState::Suspended => {}
                VmState::Suspending => {
                    // died before savevm finished; no snapshot was taken
                    warn!(
                        target: "qemuctl",
                        "exit_watcher: instance {} exited mid-suspend ({})",
                        inner.name,
                        exit.describe()
                    );
                    inner.monitor.on_shutdown();
                    inner.set_state(&mut st, VmState::Off);
                }
                VmState::Running
                | VmState::Restarting
                | VmState::DelayedShutdown
                | VmState::Unknown => {
                    info!(
                        target: "qemuctl",
                        "exit_watcher: instance {} exited ({})",
                        inner.name,
                        exit.describe()
                    );
                    inner.monitor.on_shutdown();
                    inner.set_state(&mut st, VmState::Off);
                }
            }
        });
    }

    fn spawn_event_dispatcher(&self, events: Receiver<QmpEvent>, process: Arc<RunningProcess>) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            for event in events.iter() {
                match event.name.as_str() {
                    "RESUME" => {
                        let mut st = inner.lock();
                        let ours = st
                            .process
                            .as_ref()
                            .map_or(false, |p| Arc::ptr_eq(p, &process));
                        if !ours {
                            continue;
                        }
                        match st.state {
                            VmState::Starting => {
                                inner.monitor.on_resume();
                                inner.set_state(&mut st, VmState::Running);
                            }
                            VmState::Suspending => {
                                // savevm completed and the CPUs resumed; the
                                // image now carries the snapshot tag
                                st.has_suspend_snapshot = true;
                                if let Some(process) = st.process.take() {
                                    process.kill();
                                }
                                st.qmp = None;
                                let metadata_update = st
                                    .metadata
                                    .get("machine_type")
                                    .is_some()
                                    .then(|| st.metadata.clone());
                                inner.monitor.on_suspend();
                                inner.set_state(&mut st, VmState::Off);
                                drop(st);
                                if let Some(metadata) = metadata_update {
                                    inner.monitor.update_metadata_for(&inner.name, metadata);
                                }
                            }
                            _ => {}
                        }
                    }
                    "SHUTDOWN" | "STOP" | "POWERDOWN" => {
                        debug!(
                            target: "qemuctl",
                            "events: instance {} reported {}",
                            inner.name,
                            event.name
                        );
                    }
                    other => {
                        debug!(
                            target: "qemuctl",
                            "events: ignoring {} for instance {}",
                            other,
                            inner.name
                        );
                    }
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn drive_state_for_test(&self, state: VmState) {
        let mut st = self.inner.lock();
        self.inner.set_state(&mut st, state);
    }

    #[cfg(test)]
    pub(crate) fn last_start_arguments(&self) -> Vec<String> {
        self.inner.lock().last_spawn_args.clone()
    }

    #[cfg(test)]
    pub(crate) fn has_suspend_snapshot(&self) -> bool {
        self.inner.lock().has_suspend_snapshot
    }
}

impl Drop for QemuVirtualMachine {
    fn drop(&mut self) {
        if let Ok(mut st) = self.inner.lock.lock() {
            if let Some(process) = st.process.take() {
                debug!(
                    target: "qemuctl",
                    "drop: killing leftover hypervisor for instance {}",
                    self.inner.name
                );
                process.kill();
            }
            st.qmp = None;
        }
    }
}

/// True iff `qemu-img snapshot -l` lists the suspend tag. Probe failures are
/// logged and read as "no snapshot".
fn image_has_suspend_snapshot(qemu_img: &PathBuf, image: &std::path::Path) -> bool {
    let output = MonitoredProcess::new(
        qemu_img,
        vec![
            "snapshot".to_string(),
            "-l".to_string(),
            image.display().to_string(),
        ],
    )
    .execute(PROBE_TIMEOUT);
    if !output.state.completed_successfully() {
        warn!(
            target: "qemuctl",
            "snapshot probe for {} failed ({}), assuming no suspend snapshot",
            image.display(),
            output.state.describe()
        );
        return false;
    }
    output.stdout_utf8().contains(SUSPEND_TAG)
}

/// Current virtual size of a qcow2 image, from the `(N bytes)` suffix of
/// `qemu-img info`. `None` when the probe fails or the output is unfamiliar.
fn image_virtual_size(qemu_img: &PathBuf, image: &std::path::Path) -> Option<u64> {
    let output = MonitoredProcess::new(
        qemu_img,
        vec!["info".to_string(), image.display().to_string()],
    )
    .execute(PROBE_TIMEOUT);
    if !output.state.completed_successfully() {
        return None;
    }
    let stdout = output.stdout_utf8();
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with("virtual size:"))?;
    let parenthesized = &line[line.find('(')? + 1..];
    let digits: String = parenthesized
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// The argv handed to `qemu-system-<arch>`, in contract order. A metadata
/// `arguments` array replaces the computed list wholesale.
fn assemble_arguments(
    desc: &VirtualMachineDescription,
    metadata: &Value,
    resuming: bool,
    platform: &dyn QemuPlatform,
) -> Vec<String> {
    if let Some(override_args) = metadata.get("arguments").and_then(Value::as_array) {
        return override_args
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
    }

    let mut args: Vec<String> = vec![
        "-nographic".to_string(),
        "-serial".to_string(),
        "mon:stdio".to_string(),
        "-qmp".to_string(),
        "stdio".to_string(),
        "-chardev".to_string(),
        "null,id=char0".to_string(),
    ];
    if let Some(machine_type) = metadata.get("machine_type").and_then(Value::as_str) {
        args.push("-machine".to_string());
        args.push(machine_type.to_string());
    }
    args.push("-smp".to_string());
    args.push(desc.num_cores.to_string());
    args.push("-m".to_string());
    args.push(format!("{}M", desc.mem_size.in_megabytes()));
    args.push("-drive".to_string());
    args.push(format!(
        "file={},if=virtio,format=qcow2,discard=unmap",
        desc.image.image_path.display()
    ));
    if resuming {
        args.push("-loadvm".to_string());
        args.push(SUSPEND_TAG.to_string());
    } else {
        args.push("-cdrom".to_string());
        args.push(desc.cloud_init_iso.display().to_string());
    }
    args.extend(platform.vm_platform_args(desc));
    args
}
