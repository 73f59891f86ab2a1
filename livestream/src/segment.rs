//! HLS segment file cleanup.
//!
//! ffmpeg keeps writing new segments for as long as a segmented stream runs
//! and only rotates the manifest. The janitor periodically deletes segments
//! the manifest no longer references, and removes every file of the stream
//! once the stream is gone.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, StreamId};

/// Extension of the media segments ffmpeg's HLS muxer writes by default.
const SEGMENT_EXTENSION: &str = "ts";

/// Shortest cleanup period; `tokio::time::interval` rejects zero.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Whether `file_name` belongs to the stream with `stream_id`.
///
/// Stream files are named `stream<id>` followed by anything that does not
/// start with a digit, so stream 1 never claims the files of stream 12.
pub fn is_stream_file(file_name: &str, stream_id: StreamId) -> bool {
    let prefix = format!("stream{stream_id}");
    match file_name.strip_prefix(&prefix) {
        Some(rest) => !rest.starts_with(|c: char| c.is_ascii_digit()),
        None => false,
    }
}

/// Segment URIs listed in an HLS manifest, reduced to their file names.
fn referenced_segments(manifest: &str) -> HashSet<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|uri| {
            let path = uri.split(['?', '#']).next().unwrap_or(uri);
            path.rsplit('/').next().map(str::to_string)
        })
        .collect()
}

/// Deletes the segment files of a single stream.
pub struct SegmentFileJanitor {
    stream_id: StreamId,
    directory: PathBuf,
    manifest_extension: String,
    interval: Duration,
    timer: Mutex<Option<CancellationToken>>,
}

impl SegmentFileJanitor {
    pub fn new(
        stream_id: StreamId,
        directory: impl Into<PathBuf>,
        manifest_extension: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            stream_id,
            directory: directory.into(),
            manifest_extension: manifest_extension.into(),
            interval: interval.max(MIN_CLEANUP_INTERVAL),
            timer: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Start the periodic cleanup task. Does nothing if already running.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *timer = Some(token.clone());

        let stream_id = self.stream_id;
        let directory = self.directory.clone();
        let manifest = self.manifest_name();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; nothing to clean yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(stream_id, "Segment cleanup timer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) =
                            remove_unreferenced(&directory, stream_id, &manifest).await
                        {
                            warn!(stream_id, error = %e, "Segment cleanup failed");
                        }
                    }
                }
            }
        });
        debug!(stream_id, interval = ?self.interval, "Segment cleanup timer started");
    }

    /// Stop the periodic cleanup task. Does nothing if not running.
    pub fn stop(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Delete every file of the stream, manifest included.
    ///
    /// A missing directory counts as already clean.
    pub async fn delete_all(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut deleted = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_stream_file(name, self.stream_id) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete stream file"),
            }
        }

        if deleted > 0 {
            info!(stream_id = self.stream_id, count = deleted, "Deleted stream files");
        }
        Ok(deleted)
    }

    /// Run one cleanup pass immediately.
    pub async fn remove_unreferenced(&self) -> Result<usize> {
        remove_unreferenced(&self.directory, self.stream_id, &self.manifest_name()).await
    }

    fn manifest_name(&self) -> String {
        format!("stream{}.{}", self.stream_id, self.manifest_extension)
    }
}

impl Drop for SegmentFileJanitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn remove_unreferenced(directory: &Path, stream_id: StreamId, manifest: &str) -> Result<usize> {
    let contents = match tokio::fs::read_to_string(directory.join(manifest)).await {
        Ok(contents) => contents,
        // ffmpeg has not written the manifest yet.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let keep = referenced_segments(&contents);

    let mut deleted = 0;
    let mut entries = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_segment = path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION);
        if !is_segment || !is_stream_file(name, stream_id) || keep.contains(name) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete segment"),
        }
    }

    if deleted > 0 {
        debug!(stream_id, count = deleted, "Removed stale segments");
    }
    Ok(deleted)
}
