//! Child process management for transcoding.
//!
//! A [`ProcessManager`] spawns a command line and hands back a
//! [`ProcessHandle`] carrying the child's stdio and a channel of lifecycle
//! events. The manager keeps ownership of the child itself so that it can
//! enforce a concurrency limit and terminate processes on request.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ByteReader, ByteWriter, Error, Result};

/// Time a child gets to exit after its stdin closes before it is killed.
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Identifier of a process tracked by a [`ProcessManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle notification of a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process exited. `None` when it was terminated by a signal.
    Exited(Option<i32>),
    /// Waiting on the process failed.
    Error(String),
}

/// A spawned process as seen by its user.
///
/// The stdio channels are public so the user can take the ones it needs.
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    pub stdin: Option<ByteWriter>,
    pub stdout: Option<ByteReader>,
    pub stderr: Option<ByteReader>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

impl ProcessHandle {
    pub fn new(id: ProcessId, pid: Option<u32>, events: mpsc::Receiver<ProcessEvent>) -> Self {
        Self {
            id,
            pid,
            stdin: None,
            stdout: None,
            stderr: None,
            events,
        }
    }

    pub fn with_stdin(mut self, stdin: ByteWriter) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_stdout(mut self, stdout: ByteReader) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn with_stderr(mut self, stderr: ByteReader) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Spawns and terminates managed processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn `command_line` with the given priority.
    async fn create(&self, command_line: &str, priority: i32) -> Result<ProcessHandle>;

    /// Terminate a process and wait until its exit is confirmed.
    ///
    /// Unknown or already finished processes are ignored.
    async fn kill(&self, id: ProcessId) -> Result<()>;
}

struct TrackedProcess {
    priority: i32,
    pid: Option<u32>,
    stop: CancellationToken,
    exited: watch::Receiver<bool>,
}

/// Running processes plus slots handed out to spawns still in progress.
#[derive(Default)]
struct Slots {
    running: HashMap<ProcessId, TrackedProcess>,
    reserved: usize,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.running.len() + self.reserved
    }
}

/// A slot held for one spawn. Dropping it uncommitted gives the slot back.
struct SlotReservation {
    slots: Arc<Mutex<Slots>>,
    committed: bool,
}

impl SlotReservation {
    fn commit(mut self, id: ProcessId, process: TrackedProcess) {
        let mut slots = self.slots.lock();
        slots.reserved -= 1;
        slots.running.insert(id, process);
        self.committed = true;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.lock().reserved -= 1;
        }
    }
}

/// [`ProcessManager`] backed by `tokio::process`.
///
/// At most `max_processes` children run at once. When the limit is reached a
/// new request preempts the lowest-priority running process, provided that
/// process has a strictly lower priority than the request.
pub struct FfmpegProcessManager {
    max_processes: usize,
    terminate_grace: Duration,
    next_id: AtomicU64,
    slots: Arc<Mutex<Slots>>,
}

impl FfmpegProcessManager {
    pub fn new(max_processes: usize) -> Self {
        Self {
            max_processes: max_processes.max(1),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            next_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Number of processes currently running.
    pub fn running(&self) -> usize {
        self.slots.lock().running.len()
    }

    /// Reserve a slot for a process with `priority`, preempting if allowed.
    ///
    /// The check and the reservation happen under one lock, so concurrent
    /// spawns never exceed the limit.
    async fn reserve(&self, priority: i32) -> Result<SlotReservation> {
        loop {
            let victim = {
                let mut slots = self.slots.lock();
                if slots.occupied() < self.max_processes {
                    slots.reserved += 1;
                    return Ok(SlotReservation {
                        slots: self.slots.clone(),
                        committed: false,
                    });
                }
                slots
                    .running
                    .iter()
                    .filter(|(_, p)| p.priority < priority)
                    .min_by_key(|(_, p)| p.priority)
                    .map(|(id, p)| (*id, p.pid))
            };

            let Some((id, pid)) = victim else {
                return Err(Error::ProcessSpawn(format!(
                    "process limit reached ({} running)",
                    self.max_processes
                )));
            };
            info!(process = %id, ?pid, priority, "Preempting lower priority process");
            // Another spawn may take the freed slot first; check again.
            self.kill(id).await?;
        }
    }
}

#[async_trait]
impl ProcessManager for FfmpegProcessManager {
    async fn create(&self, command_line: &str, priority: i32) -> Result<ProcessHandle> {
        let (program, args) = process_utils::split_command_line(command_line)
            .ok_or_else(|| Error::ProcessSpawn("empty command line".to_string()))?;

        let reservation = self.reserve(priority).await?;

        let mut command = process_utils::tokio_command(&program);
        command
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| Error::ProcessSpawn(format!("{program}: {e}")))?;

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pid = child.id();
        let stop = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(4);
        let (exited_tx, exited_rx) = watch::channel(false);

        let mut handle = ProcessHandle::new(id, pid, events_rx);
        if let Some(stdin) = child.stdin.take() {
            handle = handle.with_stdin(Box::pin(stdin));
        }
        if let Some(stdout) = child.stdout.take() {
            handle = handle.with_stdout(Box::pin(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            handle = handle.with_stderr(Box::pin(stderr));
        }

        reservation.commit(
            id,
            TrackedProcess {
                priority,
                pid,
                stop: stop.clone(),
                exited: exited_rx,
            },
        );
        info!(process = %id, ?pid, priority, %program, "Process spawned");

        let slots = self.slots.clone();
        let grace = self.terminate_grace;
        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => status.map(|s| s.code()),
                _ = stop.cancelled() => {
                    debug!(process = %id, "Termination requested");
                    process_utils::terminate_child(&mut child, grace).await
                }
            };

            slots.lock().running.remove(&id);

            let event = match result {
                Ok(code) => {
                    if let Some(c) = code
                        && c != 0
                    {
                        warn!(process = %id, "Process exited with code: {}", c);
                    } else {
                        debug!(process = %id, ?code, "Process exited");
                    }
                    ProcessEvent::Exited(code)
                }
                Err(e) => {
                    warn!(process = %id, "Error waiting for process: {}", e);
                    ProcessEvent::Error(e.to_string())
                }
            };
            // The handle owner may already be gone.
            let _ = events_tx.send(event).await;
            let _ = exited_tx.send(true);
        });

        Ok(handle)
    }

    async fn kill(&self, id: ProcessId) -> Result<()> {
        let tracked = {
            let slots = self.slots.lock();
            slots
                .running
                .get(&id)
                .map(|p| (p.stop.clone(), p.exited.clone()))
        };
        let Some((stop, mut exited)) = tracked else {
            return Ok(());
        };

        stop.cancel();
        // An error means the waiter task is gone, which also means the child is.
        let _ = exited.wait_for(|done| *done).await;
        Ok(())
    }
}
