//! Stream session lifecycle.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{resolve_command, segment_output_path};
use super::ended::{EndReason, EndedSignal};
use super::mode::{ProcessOption, StreamKind, StreamMode};
use super::reader::UpstreamReader;
use crate::config::AppConfig;
use crate::process::{ProcessEvent, ProcessHandle, ProcessId, ProcessManager};
use crate::segment::SegmentFileJanitor;
use crate::tuner::TunerClient;
use crate::{ByteReader, ByteWriter, ChannelId, Error, Result, StreamId};

const PIPE_BUFFER_SIZE: usize = 8192;

/// Shared collaborators and settings of all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub tuner: Arc<dyn TunerClient>,
    pub processes: Arc<dyn ProcessManager>,
    pub ffmpeg_path: String,
    pub manifest_extension: String,
    pub segment_cleanup_interval: Duration,
}

impl SessionContext {
    pub fn new(
        config: &AppConfig,
        tuner: Arc<dyn TunerClient>,
        processes: Arc<dyn ProcessManager>,
    ) -> Self {
        Self {
            tuner,
            processes,
            ffmpeg_path: config.ffmpeg_path.clone(),
            manifest_extension: config.manifest_extension.clone(),
            segment_cleanup_interval: config.segment_cleanup_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStreamInfo {
    pub mode: StreamKind,
    pub channel_id: ChannelId,
    /// Whether the session is currently serving data.
    pub is_enable: bool,
}

/// Everything a session owns while running.
struct Inner {
    state: SessionState,
    stream_id: Option<StreamId>,
    /// Closes the upstream stream wherever it currently is.
    upstream: Option<CancellationToken>,
    process: Option<ProcessId>,
    /// Stream for the consumer, until taken.
    output: Option<ByteReader>,
    janitor: Option<Arc<SegmentFileJanitor>>,
    command: Option<String>,
    output_path: Option<PathBuf>,
}

struct Shared {
    inner: Mutex<Inner>,
    ended: EndedSignal,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    /// Release everything the session holds. Safe to call any number of times.
    async fn release(&self, processes: &Arc<dyn ProcessManager>) {
        let (stream_id, upstream, process, output, janitor) = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Starting | SessionState::Active) {
                inner.state = SessionState::Stopping;
            }
            (
                inner.stream_id,
                inner.upstream.take(),
                inner.process.take(),
                inner.output.take(),
                inner.janitor.take(),
            )
        };

        drop(output);
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        if let Some(process) = process
            && let Err(e) = processes.kill(process).await
        {
            warn!(?stream_id, %process, error = %e, "Failed to kill process");
        }
        if let Some(janitor) = janitor {
            janitor.stop();
            if let Err(e) = janitor.delete_all().await {
                warn!(?stream_id, error = %e, "Failed to delete segment files");
            }
        }

        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Idle | SessionState::Stopping) {
            inner.state = SessionState::Stopped;
        }
    }

    /// React to the first end event of a running session. Later events are ignored.
    async fn handle_end(&self, processes: &Arc<dyn ProcessManager>, reason: EndReason) {
        if !self.ended.claim() {
            debug!(%reason, "Session already ending, ignoring");
            return;
        }
        let stream_id = self.inner.lock().stream_id;
        info!(?stream_id, %reason, "Stream ended");
        self.release(processes).await;
        self.ended.publish(reason);
    }
}

/// One live stream: an upstream tuner stream, optionally piped through a
/// transcoding process.
///
/// `start` and `stop` must not run concurrently; `stop` may be called at any
/// other time, any number of times.
pub struct StreamSession {
    option: ProcessOption,
    ctx: SessionContext,
    shared: Arc<Shared>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("option", &self.option)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub fn new(option: ProcessOption, ctx: SessionContext) -> Self {
        Self {
            option,
            ctx,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    stream_id: None,
                    upstream: None,
                    process: None,
                    output: None,
                    janitor: None,
                    command: None,
                    output_path: None,
                }),
                ended: EndedSignal::new(),
            }),
        }
    }

    pub fn option(&self) -> &ProcessOption {
        &self.option
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.shared.inner.lock().stream_id
    }

    /// The resolved transcode command, once started.
    pub fn command(&self) -> Option<String> {
        self.shared.inner.lock().command.clone()
    }

    /// Manifest path of a segmented stream, once started.
    pub fn output_path(&self) -> Option<PathBuf> {
        self.shared.inner.lock().output_path.clone()
    }

    pub fn holds_upstream(&self) -> bool {
        self.shared.inner.lock().upstream.is_some()
    }

    pub fn holds_process(&self) -> bool {
        self.shared.inner.lock().process.is_some()
    }

    pub fn ended(&self) -> &EndedSignal {
        &self.shared.ended
    }

    /// Wait for the session to end, however that happens.
    pub async fn wait_ended(&self) -> EndReason {
        self.shared.ended.wait().await
    }

    pub fn info(&self) -> LiveStreamInfo {
        LiveStreamInfo {
            mode: self.option.kind(),
            channel_id: self.option.channel_id,
            is_enable: self.state() == SessionState::Active,
        }
    }

    /// Take the stream to serve: the process output for transcoded streams,
    /// the upstream itself otherwise. It can be taken once.
    pub fn stream(&self) -> Result<ByteReader> {
        self.shared
            .inner
            .lock()
            .output
            .take()
            .ok_or(Error::StreamUnavailable)
    }

    pub async fn start(&self, stream_id: StreamId) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(Error::config(format!(
                    "session cannot start from state {}",
                    inner.state
                )));
            }
            inner.state = SessionState::Starting;
            inner.stream_id = Some(stream_id);
        }

        match self.start_inner(stream_id).await {
            Ok(()) => {
                info!(
                    stream_id,
                    channel_id = self.option.channel_id,
                    mode = %self.option.kind(),
                    "Stream started"
                );
                Ok(())
            }
            Err(e) => {
                error!(stream_id, channel_id = self.option.channel_id, error = %e, "Failed to start stream");
                self.shared.release(&self.ctx.processes).await;
                self.shared.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Every resource acquired here is recorded in `Inner` right away, so the
    /// caller can release it on failure.
    async fn start_inner(&self, stream_id: StreamId) -> Result<()> {
        let mode = StreamMode::from_option(&self.option)?;

        if let Some(directory) = mode.segment_directory() {
            self.prepare_segment_directory(directory, stream_id).await?;
        }

        let upstream = self
            .ctx
            .tuner
            .open_service_stream(self.option.channel_id, self.option.priority)
            .await
            .map_err(|e| match e {
                Error::SourceAcquisition(_) => e,
                other => Error::SourceAcquisition(other.to_string()),
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        match mode.command() {
            None => {
                let token = CancellationToken::new();
                let reader = UpstreamReader::new(upstream, token.clone(), events_tx);
                let mut inner = self.shared.inner.lock();
                inner.upstream = Some(token);
                inner.output = Some(Box::pin(reader));
            }
            Some(template) => {
                let command = resolve_command(
                    template,
                    &self.ctx.ffmpeg_path,
                    mode.segment_directory(),
                    stream_id,
                );
                self.shared.inner.lock().command = Some(command.clone());
                debug!(stream_id, %command, "Spawning transcoder");

                // On error the upstream is dropped here, closing it.
                let handle = self
                    .ctx
                    .processes
                    .create(&command, self.option.priority)
                    .await
                    .map_err(|e| match e {
                        Error::ProcessSpawn(_) => e,
                        other => Error::ProcessSpawn(other.to_string()),
                    })?;
                self.wire_process(stream_id, upstream, handle, events_tx)?;

                let janitor = self.shared.inner.lock().janitor.clone();
                if let Some(janitor) = janitor {
                    janitor.start();
                }
            }
        }

        self.shared.set_state(SessionState::Active);

        // Events queued before this point are picked up here.
        let shared = self.shared.clone();
        let processes = self.ctx.processes.clone();
        tokio::spawn(watch_end_events(shared, processes, events_rx));
        Ok(())
    }

    /// Check the HLS directory, creating it if absent, and purge stale files.
    /// From here on the session owns the stream's files.
    async fn prepare_segment_directory(&self, directory: &Path, stream_id: StreamId) -> Result<()> {
        ensure_stream_directory(directory, stream_id).await?;

        let janitor = Arc::new(SegmentFileJanitor::new(
            stream_id,
            directory,
            self.ctx.manifest_extension.clone(),
            self.ctx.segment_cleanup_interval,
        ));
        janitor
            .delete_all()
            .await
            .map_err(|e| match e {
                Error::Io(source) => Error::directory_access(directory, source),
                other => other,
            })?;

        let mut inner = self.shared.inner.lock();
        inner.output_path = Some(segment_output_path(
            directory,
            stream_id,
            &self.ctx.manifest_extension,
        ));
        inner.janitor = Some(janitor);
        Ok(())
    }

    fn wire_process(
        &self,
        stream_id: StreamId,
        upstream: ByteReader,
        mut handle: ProcessHandle,
        events_tx: mpsc::UnboundedSender<EndReason>,
    ) -> Result<()> {
        let process_id = handle.id();
        self.shared.inner.lock().process = Some(process_id);

        let Some(stdin) = handle.stdin.take() else {
            return Err(Error::ProcessStdinUnavailable);
        };
        info!(stream_id, process = %process_id, pid = ?handle.pid(), "Transcoder started");

        let token = CancellationToken::new();
        {
            let mut inner = self.shared.inner.lock();
            inner.upstream = Some(token.clone());
            inner.output = handle.stdout.take();
        }

        tokio::spawn(pipe_upstream(stream_id, upstream, stdin, token));

        if let Some(stderr) = handle.stderr.take() {
            tokio::spawn(log_diagnostics(stream_id, stderr));
        }

        let mut events = handle.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let reason = match event {
                    ProcessEvent::Exited(code) => EndReason::ProcessExited(code),
                    ProcessEvent::Error(e) => EndReason::ProcessError(e),
                };
                if events_tx.send(reason).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Tear the session down. Never fails for lack of anything to stop.
    pub async fn stop(&self) -> Result<()> {
        let claimed = self.shared.ended.claim();
        self.shared.release(&self.ctx.processes).await;
        if claimed {
            info!(stream_id = ?self.stream_id(), "Stream stopped");
            self.shared.ended.publish(EndReason::Stopped);
        }
        Ok(())
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        // Closing the upstream ends a passthrough stream on its own; a
        // process still needs an explicit stop.
        let inner = self.shared.inner.lock();
        if let Some(upstream) = &inner.upstream {
            upstream.cancel();
        }
        if inner.process.is_some() {
            warn!(stream_id = ?inner.stream_id, "Session dropped without stop()");
        }
    }
}

async fn watch_end_events(
    shared: Arc<Shared>,
    processes: Arc<dyn ProcessManager>,
    mut events: mpsc::UnboundedReceiver<EndReason>,
) {
    while let Some(reason) = events.recv().await {
        shared.handle_end(&processes, reason).await;
    }
}

/// Forward the upstream into the process stdin until either side closes.
async fn pipe_upstream(
    stream_id: StreamId,
    mut upstream: ByteReader,
    mut stdin: ByteWriter,
    cancel: CancellationToken,
) {
    let mut buffer = [0u8; PIPE_BUFFER_SIZE];
    loop {
        let step = async {
            let n = upstream.read(&mut buffer).await?;
            if n > 0 {
                stdin.write_all(&buffer[..n]).await?;
            }
            Ok::<usize, std::io::Error>(n)
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(stream_id, "Upstream pipe cancelled");
                break;
            }
            result = step => match result {
                Ok(0) => {
                    debug!(stream_id, "Upstream reached end of stream");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(stream_id, error = %e, "Upstream pipe failed");
                    break;
                }
            }
        }
    }
    drop(upstream);
    // Closing stdin lets the transcoder flush and exit.
    let _ = stdin.shutdown().await;
}

async fn log_diagnostics(stream_id: StreamId, stderr: ByteReader) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(stream_id, "transcoder: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(stream_id, error = %e, "Error reading transcoder stderr");
                break;
            }
        }
    }
}

/// Make sure `directory` exists and is readable and writable.
async fn ensure_stream_directory(directory: &Path, stream_id: StreamId) -> Result<()> {
    match tokio::fs::metadata(directory).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::directory_access(
                directory,
                std::io::Error::other("not a directory"),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %directory.display(), "Creating stream directory");
            tokio::fs::create_dir_all(directory)
                .await
                .map_err(|e| Error::directory_access(directory, e))?;
        }
        Err(e) => return Err(Error::directory_access(directory, e)),
    }

    tokio::fs::read_dir(directory)
        .await
        .map_err(|e| Error::directory_access(directory, e))?;

    let probe = directory.join(format!(".write-probe-{}-{}", std::process::id(), stream_id));
    tokio::fs::write(&probe, b"")
        .await
        .map_err(|e| Error::directory_access(directory, e))?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}
