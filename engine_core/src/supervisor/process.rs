//! Ownership of one spawned engine process.
//!
//! A watcher task owns the `Child`. Everyone else holds a cheap `ProcessHandle`
//! that can signal the watcher and observe the exit code.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessSignal {
    /// SIGTERM on unix. Windows has no graceful equivalent and kills.
    Terminate,
    Kill,
}

/// `None` while running, `Some(code)` once exited (`code` is `None` when
/// the process died from a signal).
type ExitSlot = Option<Option<i32>>;

#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    pub pid: Option<u32>,
    control: mpsc::UnboundedSender<ProcessSignal>,
    exit: watch::Receiver<ExitSlot>,
}

pub(crate) struct SpawnedEngine {
    pub handle: ProcessHandle,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Spawns `<exe> run -c <config>` in `working_dir` with both pipes captured.
pub(crate) fn spawn_engine(exe: &Path, config: &Path, working_dir: &Path) -> io::Result<SpawnedEngine> {
    let mut child = Command::new(exe)
        .arg("run")
        .arg("-c")
        .arg(config)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (control, control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit) = watch::channel(None);

    tokio::spawn(watch_child(child, control_rx, exit_tx));

    Ok(SpawnedEngine {
        handle: ProcessHandle { pid, control, exit },
        stdout,
        stderr,
    })
}

async fn watch_child(
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<ProcessSignal>,
    exit_tx: watch::Sender<ExitSlot>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = control_rx.recv() => {
                let result = match signal {
                    ProcessSignal::Terminate => terminate(&mut child),
                    ProcessSignal::Kill => child.start_kill(),
                };
                if let Err(e) = result {
                    log::warn!("Failed to deliver {:?} to engine: {}", signal, e);
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::error!("Failed to wait for engine process: {}", e);
            None
        }
    };
    let _ = exit_tx.send(Some(code));
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
        // Already reaped.
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

impl ProcessHandle {
    pub fn signal(&self, signal: ProcessSignal) {
        // A closed channel means the watcher already saw the exit.
        let _ = self.control.send(signal);
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// A receiver that resolves once the process exits.
    pub fn exit_receiver(&self) -> watch::Receiver<ExitSlot> {
        self.exit.clone()
    }

    /// Waits up to `limit` for the exit. `None` when still running afterwards.
    pub async fn wait_exit(&self, limit: Duration) -> Option<Option<i32>> {
        let mut rx = self.exit.clone();
        match tokio::time::timeout(limit, wait_for_exit(&mut rx)).await {
            Ok(code) => Some(code),
            Err(_) => None,
        }
    }
}

/// Resolves with the exit code. A dropped watcher counts as an exit.
pub(crate) async fn wait_for_exit(rx: &mut watch::Receiver<ExitSlot>) -> Option<i32> {
    match rx.wait_for(|slot| slot.is_some()).await {
        Ok(slot) => (*slot).flatten(),
        Err(_) => None,
    }
}
