//! In-memory tuner and process manager used by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::process::{ProcessEvent, ProcessHandle, ProcessId, ProcessManager};
use crate::tuner::TunerClient;
use crate::{ByteReader, ChannelId, Error, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Reader that flags its own destruction.
struct TrackedReader {
    inner: DuplexStream,
    destroyed: Arc<AtomicBool>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// An upstream stream opened through [`FakeTuner`].
pub struct OpenedStream {
    pub channel_id: ChannelId,
    pub priority: i32,
    /// Write side feeding the session. Drop it to end the stream.
    pub feed: Option<DuplexStream>,
    pub destroyed: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct FakeTuner {
    pub fail: bool,
    opened: Mutex<Vec<OpenedStream>>,
}

impl FakeTuner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn take_feed(&self, index: usize) -> DuplexStream {
        self.opened.lock()[index].feed.take().expect("feed already taken")
    }

    pub fn is_destroyed(&self, index: usize) -> bool {
        self.opened.lock()[index].destroyed.load(Ordering::SeqCst)
    }

    pub fn stream_args(&self, index: usize) -> (ChannelId, i32) {
        let opened = self.opened.lock();
        (opened[index].channel_id, opened[index].priority)
    }
}

#[async_trait]
impl TunerClient for FakeTuner {
    async fn open_service_stream(&self, channel_id: ChannelId, priority: i32) -> Result<ByteReader> {
        if self.fail {
            return Err(Error::SourceAcquisition(format!("{channel_id}: tuner busy")));
        }
        let (feed, read_side) = tokio::io::duplex(PIPE_CAPACITY);
        let destroyed = Arc::new(AtomicBool::new(false));
        self.opened.lock().push(OpenedStream {
            channel_id,
            priority,
            feed: Some(feed),
            destroyed: destroyed.clone(),
        });
        Ok(Box::pin(TrackedReader {
            inner: read_side,
            destroyed,
        }))
    }
}

/// A process spawned through [`FakeProcessManager`].
pub struct FakeProcess {
    pub id: ProcessId,
    pub command: String,
    pub priority: i32,
    pub events: mpsc::Sender<ProcessEvent>,
    /// Receives what the session writes to the process stdin.
    pub stdin_peer: Option<DuplexStream>,
    /// Writes here come out of the process stdout.
    pub stdout_peer: Option<DuplexStream>,
}

/// Runs on every create with the command line; an error fails the spawn.
pub type SpawnHook = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct FakeProcessManager {
    pub fail_spawn: bool,
    pub without_stdin: bool,
    spawn_hook: Option<SpawnHook>,
    next_id: AtomicU64,
    processes: Mutex<Vec<FakeProcess>>,
    killed: Mutex<Vec<ProcessId>>,
}

impl FakeProcessManager {
    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Default::default()
        }
    }

    pub fn without_stdin() -> Self {
        Self {
            without_stdin: true,
            ..Default::default()
        }
    }

    pub fn with_spawn_hook(
        mut self,
        hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spawn_hook = Some(Box::new(hook));
        self
    }

    pub fn spawned(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn command(&self, index: usize) -> String {
        self.processes.lock()[index].command.clone()
    }

    pub fn priority(&self, index: usize) -> i32 {
        self.processes.lock()[index].priority
    }

    pub fn killed(&self) -> Vec<ProcessId> {
        self.killed.lock().clone()
    }

    pub fn events(&self, index: usize) -> mpsc::Sender<ProcessEvent> {
        self.processes.lock()[index].events.clone()
    }

    pub fn take_stdin_peer(&self, index: usize) -> DuplexStream {
        self.processes.lock()[index]
            .stdin_peer
            .take()
            .expect("stdin peer already taken")
    }

    pub fn take_stdout_peer(&self, index: usize) -> DuplexStream {
        self.processes.lock()[index]
            .stdout_peer
            .take()
            .expect("stdout peer already taken")
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn create(&self, command_line: &str, priority: i32) -> Result<ProcessHandle> {
        if self.fail_spawn {
            return Err(Error::ProcessSpawn("spawn refused".to_string()));
        }
        if let Some(hook) = &self.spawn_hook {
            hook(command_line)?;
        }

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (stdin, stdin_peer) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_peer, stdout) = tokio::io::duplex(PIPE_CAPACITY);

        let mut handle = ProcessHandle::new(id, Some(1000 + id.0 as u32), events_rx)
            .with_stdout(Box::pin(stdout))
            .with_stderr(Box::pin(tokio::io::empty()));
        if !self.without_stdin {
            handle = handle.with_stdin(Box::pin(stdin));
        }

        self.processes.lock().push(FakeProcess {
            id,
            command: command_line.to_string(),
            priority,
            events: events_tx,
            stdin_peer: Some(stdin_peer),
            stdout_peer: Some(stdout_peer),
        });
        Ok(handle)
    }

    async fn kill(&self, id: ProcessId) -> Result<()> {
        self.killed.lock().push(id);
        let events = self
            .processes
            .lock()
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.events.clone());
        if let Some(events) = events {
            let _ = events.try_send(ProcessEvent::Exited(None));
        }
        Ok(())
    }
}
