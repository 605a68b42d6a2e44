use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Upper bound on waiting for the reply to a QMP command. Public so tests
/// can reason about worst-case blocking.
pub const QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Depth of the bounded per-session event queue. Events beyond this are
/// dropped with a warning; the state machine only reacts to the latest
/// lifecycle events, so backlog is never meaningful.
const EVENT_QUEUE_DEPTH: usize = 64;

/// An asynchronous QMP event such as `RESUME` or `SHUTDOWN`.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
}

/// A QMP session over a supervised process' stdio.
///
/// Frames one JSON object per line on stdin; consumes newline-delimited JSON
/// from stdout. Replies are correlated in FIFO order (QMP is strictly
/// sequential over a single channel); events are routed to a separate
/// bounded queue. A write failure marks the session broken for good.
pub struct QmpSession {
    writer: Mutex<ChildStdin>,
    replies: Mutex<Receiver<Value>>,
    events: Mutex<Option<Receiver<QmpEvent>>>,
    broken: AtomicBool,
}

impl QmpSession {
    /// Accept the greeting banner and negotiate capabilities. The handshake
    /// sends `qmp_capabilities` exactly once.
    pub fn establish(stdin: ChildStdin, stdout: ChildStdout) -> Result<Self> {
        let (reply_tx, reply_rx) = mpsc::channel::<Value>();
        let (event_tx, event_rx) = mpsc::sync_channel::<QmpEvent>(EVENT_QUEUE_DEPTH);

        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        debug!("qmp stream closed: {}", err);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("discarding malformed qmp frame: {} ({})", line.trim(), err);
                        continue;
                    }
                };
                if let Some(name) = value.get("event").and_then(Value::as_str) {
                    let event = QmpEvent {
                        name: name.to_string(),
                        data: value.clone(),
                    };
                    match event_tx.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(event)) => {
                            warn!("qmp event queue full, dropping {}", event.name);
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                } else if reply_tx.send(value).is_err() {
                    // session dropped; stop reading
                    break;
                }
            }
        });

        let session = Self {
            writer: Mutex::new(stdin),
            replies: Mutex::new(reply_rx),
            events: Mutex::new(Some(event_rx)),
            broken: AtomicBool::new(false),
        };

        let greeting = session.receive_reply("waiting for qmp greeting")?;
        if greeting.get("QMP").is_none() {
            return Err(Error::QmpChannel(format!(
                "unexpected qmp greeting: {}",
                greeting
            )));
        }
        session.execute(json!({"execute": "qmp_capabilities"}))?;
        Ok(session)
    }

    /// Send a command and block for its reply, up to `QMP_COMMAND_TIMEOUT`.
    pub fn execute(&self, command: Value) -> Result<Value> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::QmpChannel("session is broken".to_string()));
        }

        let label = command
            .get("execute")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string();
        debug!("qmp execute: {}", label);

        {
            let mut writer = self.writer.lock().expect("poisoned qmp writer mutex");
            let frame = command.to_string();
            if let Err(err) = writer
                .write_all(frame.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush())
            {
                self.broken.store(true, Ordering::SeqCst);
                return Err(Error::QmpChannel(format!(
                    "writing {} failed: {}",
                    label, err
                )));
            }
        }

        let reply = self.receive_reply(&format!("waiting for qmp reply to {}", label))?;
        if let Some(err) = reply.get("error") {
            return Err(Error::QmpChannel(format!(
                "{} failed: {}",
                label, err
            )));
        }
        Ok(reply)
    }

    /// Shorthand for argument-less commands such as `system_powerdown`.
    pub fn execute_command(&self, name: &str) -> Result<Value> {
        self.execute(json!({"execute": name}))
    }

    /// Issue an HMP command (`savevm`/`loadvm`) through the QMP transport.
    pub fn human_monitor_command(&self, command_line: &str) -> Result<Value> {
        self.execute(json!({
            "execute": "human-monitor-command",
            "arguments": {"command-line": command_line},
        }))
    }

    /// Claim the event queue. The single consumer is the VM's dispatch
    /// thread; a second call returns `None`.
    pub fn take_events(&self) -> Option<Receiver<QmpEvent>> {
        self.events.lock().expect("poisoned qmp event mutex").take()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn receive_reply(&self, operation: &str) -> Result<Value> {
        let replies = self.replies.lock().expect("poisoned qmp reply mutex");
        match replies.recv_timeout(QMP_COMMAND_TIMEOUT) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                operation: operation.to_string(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                self.broken.store(true, Ordering::SeqCst);
                Err(Error::QmpChannel("qmp stream closed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MonitoredProcess;

    // A stand-in QEMU monitor: greets, answers commands, emits events.
    const FAKE_MONITOR: &str = r#"
echo '{"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": []}}'
while read line; do
  case "$line" in
    *qmp_capabilities*) echo '{"return": {}}' ;;
    *query-status*) echo '{"return": {"status": "running", "running": true}}' ;;
    *make-noise*) echo 'not json at all'; echo '{"return": {}}' ;;
    *make-event*)
      echo '{"timestamp": {"seconds": 1541188919, "microseconds": 838498}, "event": "RESUME"}'
      echo '{"return": {}}'
      ;;
    *make-error*) echo '{"error": {"class": "GenericError", "desc": "nope"}}' ;;
    *) echo '{"return": {}}' ;;
  esac
done
"#;

    fn establish_fake() -> (crate::process::RunningProcess, QmpSession) {
        let handle = MonitoredProcess::new("sh", vec!["-c".into(), FAKE_MONITOR.into()])
            .start()
            .unwrap();
        let stdin = handle.take_stdin().unwrap();
        let stdout = handle.take_stdout().unwrap();
        let session = QmpSession::establish(stdin, stdout).unwrap();
        (handle, session)
    }

    #[test]
    fn handshake_and_command_round_trip() {
        let (handle, session) = establish_fake();
        let reply = session.execute_command("query-status").unwrap();
        assert_eq!(reply["return"]["status"], "running");
        handle.kill();
        handle.wait();
    }

    #[test]
    fn malformed_frames_are_discarded() {
        let (handle, session) = establish_fake();
        // the garbage line is skipped and the real reply still correlates
        let reply = session.execute_command("make-noise").unwrap();
        assert!(reply.get("return").is_some());
        handle.kill();
        handle.wait();
    }

    #[test]
    fn events_are_routed_to_the_event_queue() {
        let (handle, session) = establish_fake();
        let events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        session.execute_command("make-event").unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.name, "RESUME");
        assert!(event.data["timestamp"]["seconds"].is_number());
        handle.kill();
        handle.wait();
    }

    #[test]
    fn error_replies_surface_as_channel_errors() {
        let (handle, session) = establish_fake();
        let err = session.execute_command("make-error").unwrap_err();
        assert!(matches!(err, Error::QmpChannel(_)));
        handle.kill();
        handle.wait();
    }

    #[test]
    fn closed_stream_breaks_the_session() {
        let (handle, session) = establish_fake();
        handle.kill();
        handle.wait();
        // writes may still land in the pipe buffer; the reply side reports
        // the closed stream either way
        let err = session.execute_command("query-status").unwrap_err();
        assert!(matches!(err, Error::QmpChannel(_) | Error::Timeout { .. }));
    }
}
