use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ChannelId, Error, Result};

/// What a session is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOption {
    pub channel_id: ChannelId,
    /// Transcode command template. `None` serves the tuner stream as is.
    pub command: Option<String>,
    /// Directory for HLS output. Only set for segmented streams.
    pub output_path: Option<PathBuf>,
    /// Passed to both the tuner and the process manager.
    pub priority: i32,
}

impl ProcessOption {
    pub fn passthrough(channel_id: ChannelId, priority: i32) -> Self {
        Self {
            channel_id,
            command: None,
            output_path: None,
            priority,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// The kind of stream this option describes, without validating it.
    pub fn kind(&self) -> StreamKind {
        match (&self.command, &self.output_path) {
            (None, _) => StreamKind::Passthrough,
            (Some(_), None) => StreamKind::Encoded,
            (Some(_), Some(_)) => StreamKind::SegmentedEncoded,
        }
    }
}

/// Tag reported in stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Passthrough,
    Encoded,
    SegmentedEncoded,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Encoded => "encoded",
            Self::SegmentedEncoded => "segmentedEncoded",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated stream mode, fixed when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMode {
    Passthrough,
    Encoded { command: String },
    Segmented { command: String, directory: PathBuf },
}

impl StreamMode {
    pub fn from_option(option: &ProcessOption) -> Result<Self> {
        let command = match option.command.as_deref().map(str::trim) {
            Some("") => return Err(Error::config("transcode command is empty")),
            Some(command) => Some(command.to_string()),
            None => None,
        };

        match (command, &option.output_path) {
            (None, None) => Ok(Self::Passthrough),
            (None, Some(path)) => Err(Error::config(format!(
                "output path {} given without a transcode command",
                path.display()
            ))),
            (Some(command), None) => Ok(Self::Encoded { command }),
            (Some(_), Some(path)) if path.as_os_str().is_empty() => {
                Err(Error::config("output path is empty"))
            }
            (Some(command), Some(directory)) => Ok(Self::Segmented {
                command,
                directory: directory.clone(),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Passthrough => StreamKind::Passthrough,
            Self::Encoded { .. } => StreamKind::Encoded,
            Self::Segmented { .. } => StreamKind::SegmentedEncoded,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Passthrough => None,
            Self::Encoded { command } | Self::Segmented { command, .. } => Some(command),
        }
    }

    /// Directory whose segment files the session must manage.
    pub fn segment_directory(&self) -> Option<&Path> {
        match self {
            Self::Segmented { directory, .. } => Some(directory),
            _ => None,
        }
    }
}
