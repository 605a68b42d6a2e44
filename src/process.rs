use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Poll cadence for bounded waits on child processes.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Classification of a supervised-process failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    FailedToStart,
    Crashed,
    Timedout,
    ReadError,
    WriteError,
    UnknownError,
}

#[derive(Debug, Clone)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
}

/// Terminal state of a process. Exactly one of `exit_code` and `error` is
/// populated once the process has finished.
#[derive(Debug, Clone, Default)]
pub struct ProcessState {
    pub exit_code: Option<i32>,
    pub error: Option<ProcessError>,
}

impl ProcessState {
    pub fn completed_successfully(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }

    pub fn describe(&self) -> String {
        match (&self.exit_code, &self.error) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(err)) => format!("{:?}: {}", err.kind, err.message),
            (None, None) => "unknown status".to_string(),
        }
    }

    fn from_exit_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self {
                exit_code: Some(code),
                error: None,
            },
            None => {
                let signal = status.signal().unwrap_or(0);
                Self {
                    exit_code: None,
                    error: Some(ProcessError {
                        kind: ProcessErrorKind::Crashed,
                        message: format!("terminated by signal {}", signal),
                    }),
                }
            }
        }
    }

    fn from_error(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            error: Some(ProcessError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Captured result of a one-shot `execute` run.
#[derive(Debug)]
pub struct ProcessOutput {
    pub state: ProcessState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// An external command, either run to completion (`execute`) or launched
/// under supervision (`start`).
#[derive(Debug, Clone)]
pub struct MonitoredProcess {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl MonitoredProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run the child to completion, capturing stdout and stderr in full.
    /// Launch failures and timeouts are encoded in the returned
    /// `ProcessState` rather than an `Err`, so probe callers can recover.
    pub fn execute(&self, timeout: Duration) -> ProcessOutput {
        debug!("executing {} {:?}", self.program.display(), self.args);

        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ProcessOutput {
                    state: ProcessState::from_error(
                        ProcessErrorKind::FailedToStart,
                        format!("launching {}: {}", self.program.display(), err),
                    ),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                };
            }
        };

        let stdout_reader = child.stdout.take().map(spawn_capture_thread);
        let stderr_reader = child.stderr.take().map(spawn_capture_thread);

        let deadline = Instant::now() + timeout;
        let state = loop {
            match child.try_wait() {
                Ok(Some(status)) => break ProcessState::from_exit_status(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "{} did not finish within {:?}, killing",
                            self.program.display(),
                            timeout
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        break ProcessState::from_error(
                            ProcessErrorKind::Timedout,
                            format!("{} timed out after {:?}", self.program.display(), timeout),
                        );
                    }
                    thread::sleep(WAIT_POLL_INTERVAL.min(deadline - Instant::now()));
                }
                Err(err) => {
                    break ProcessState::from_error(
                        ProcessErrorKind::UnknownError,
                        format!("waiting for {}: {}", self.program.display(), err),
                    );
                }
            }
        };

        let stdout = stdout_reader.map(join_capture).unwrap_or_default();
        let stderr = stderr_reader.map(join_capture).unwrap_or_default();
        ProcessOutput {
            state,
            stdout,
            stderr,
        }
    }

    /// Launch the child asynchronously with piped stdio and a stderr capture
    /// thread. The returned handle owns the child for its lifetime.
    pub fn start(self) -> Result<RunningProcess> {
        debug!("starting {} {:?}", self.program.display(), self.args);

        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| Error::Io {
            path: self.program.clone(),
            source,
        })?;

        let pid = child.id() as libc::pid_t;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_thread = child.stderr.take().map(|mut stream| {
            let buf = Arc::clone(&stderr_buf);
            thread::spawn(move || {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => buf
                            .lock()
                            .expect("poisoned stderr buffer mutex")
                            .extend_from_slice(&chunk[..n]),
                        Err(err) => {
                            debug!("stderr read for pid {} ended: {}", pid, err);
                            break;
                        }
                    }
                }
            })
        });

        Ok(RunningProcess {
            pid,
            program: self.program,
            state: Mutex::new(ChildState {
                child: Some(child),
                stderr_thread,
                exit: None,
            }),
            stderr_buf,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
        })
    }
}

fn spawn_capture_thread<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(err) = stream.read_to_end(&mut buf) {
            debug!("output capture ended early: {}", err);
        }
        buf
    })
}

fn join_capture(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[derive(Debug)]
struct ChildState {
    child: Option<Child>,
    stderr_thread: Option<JoinHandle<()>>,
    exit: Option<ProcessState>,
}

/// A handle to a supervised child process.
///
/// The stdin/stdout streams can be taken exactly once (the QMP session claims
/// them); stderr is captured continuously into an internal buffer.
#[derive(Debug)]
pub struct RunningProcess {
    pid: libc::pid_t,
    program: PathBuf,
    state: Mutex<ChildState>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
}

impl RunningProcess {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub(crate) fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().expect("poisoned stdin mutex").take()
    }

    pub(crate) fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().expect("poisoned stdout mutex").take()
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&self) -> Option<ProcessState> {
        let mut state = self.state.lock().expect("poisoned child state mutex");
        if let Some(exit) = state.exit.clone() {
            return Some(exit);
        }
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let exit = ProcessState::from_exit_status(status);
                state.child = None;
                state.exit = Some(exit.clone());
                Some(exit)
            }
            Ok(None) => None,
            Err(err) => {
                let exit = ProcessState::from_error(
                    ProcessErrorKind::UnknownError,
                    format!("waiting for pid {}: {}", self.pid, err),
                );
                state.child = None;
                state.exit = Some(exit.clone());
                Some(exit)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.try_wait().is_none()
    }

    /// Block until the child exits, then drain the stderr capture thread so
    /// the full error output is available to the caller.
    pub fn wait(&self) -> ProcessState {
        let (child, stderr_thread) = {
            let mut state = self.state.lock().expect("poisoned child state mutex");
            if let Some(exit) = state.exit.clone() {
                return exit;
            }
            (state.child.take(), state.stderr_thread.take())
        };

        let exit = match child {
            Some(mut child) => match child.wait() {
                Ok(status) => ProcessState::from_exit_status(status),
                Err(err) => ProcessState::from_error(
                    ProcessErrorKind::UnknownError,
                    format!("waiting for pid {}: {}", self.pid, err),
                ),
            },
            None => {
                // Another waiter holds the child; spin until it records the exit.
                loop {
                    {
                        let state = self.state.lock().expect("poisoned child state mutex");
                        if let Some(exit) = state.exit.clone() {
                            return exit;
                        }
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        };

        if let Some(handle) = stderr_thread {
            let _ = handle.join();
        }

        let mut state = self.state.lock().expect("poisoned child state mutex");
        state.exit = Some(exit.clone());
        exit
    }

    /// Block until exit or timeout; `None` means the child is still running.
    pub fn wait_for_finished(&self, timeout: Duration) -> Option<ProcessState> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_wait() {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Send SIGTERM. A no-op if the child already exited.
    pub fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    /// Send SIGKILL. A no-op if the child already exited.
    pub fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, signal: libc::c_int) {
        let result = unsafe { libc::kill(self.pid, signal) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("signalling pid {} with {} failed: {}", self.pid, signal, err);
            }
        }
    }

    /// Everything the child has written to stderr so far.
    pub fn read_all_standard_error(&self) -> String {
        let buf = self.stderr_buf.lock().expect("poisoned stderr buffer mutex");
        String::from_utf8_lossy(&buf).to_string()
    }
}
