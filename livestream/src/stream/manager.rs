use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

use super::mode::ProcessOption;
use super::session::{LiveStreamInfo, SessionContext, StreamSession};
use crate::config::LivePreset;
use crate::{ChannelId, Error, Result, StreamId};

/// Registry of running stream sessions.
pub struct StreamManager {
    ctx: SessionContext,
    stream_files_dir: PathBuf,
    default_priority: i32,
    next_id: AtomicU32,
    sessions: Arc<Mutex<HashMap<StreamId, Arc<StreamSession>>>>,
}

impl StreamManager {
    pub fn new(ctx: SessionContext, stream_files_dir: impl Into<PathBuf>, default_priority: i32) -> Self {
        Self {
            ctx,
            stream_files_dir: stream_files_dir.into(),
            default_priority,
            next_id: AtomicU32::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the option for watching `channel_id` live, optionally transcoded
    /// with `preset`. HLS presets write to the stream files directory.
    pub fn live_option(&self, channel_id: ChannelId, preset: Option<&LivePreset>) -> ProcessOption {
        let option = ProcessOption::passthrough(channel_id, self.default_priority);
        match preset {
            None => option,
            Some(preset) if preset.hls => option
                .with_command(&preset.command)
                .with_output_path(&self.stream_files_dir),
            Some(preset) => option.with_command(&preset.command),
        }
    }

    /// Start a session and register it until it ends.
    pub async fn start_stream(&self, option: ProcessOption) -> Result<(StreamId, Arc<StreamSession>)> {
        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(StreamSession::new(option, self.ctx.clone()));
        session.start(stream_id).await?;

        self.sessions.lock().insert(stream_id, session.clone());
        debug!(stream_id, "Stream registered");

        let sessions = self.sessions.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            let reason = watched.wait_ended().await;
            let mut sessions = sessions.lock();
            if sessions
                .get(&stream_id)
                .is_some_and(|current| Arc::ptr_eq(current, &watched))
            {
                sessions.remove(&stream_id);
                debug!(stream_id, %reason, "Stream unregistered");
            }
        });

        Ok((stream_id, session))
    }

    pub fn get(&self, stream_id: StreamId) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(&stream_id).cloned()
    }

    /// Infos of all registered sessions, ordered by stream id.
    pub fn list(&self) -> Vec<(StreamId, LiveStreamInfo)> {
        let mut infos: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.info()))
            .collect();
        infos.sort_by_key(|(id, _)| *id);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn stop(&self, stream_id: StreamId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(&stream_id)
            .ok_or_else(|| Error::not_found("Stream", stream_id))?;
        session.stop().await?;
        info!(stream_id, "Stream stopped by request");
        Ok(())
    }

    /// Stop every session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.lock().drain().collect();
        let count = sessions.len();
        for (stream_id, session) in sessions {
            if let Err(e) = session.stop().await {
                warn!(stream_id, error = %e, "Failed to stop stream");
            }
        }
        if count > 0 {
            info!(count, "Stopped all streams");
        }
        count
    }
}
