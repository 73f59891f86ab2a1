//! Transcode command templates.
//!
//! Templates are plain command lines with placeholders:
//! - `%FFMPEG%` - path of the ffmpeg binary
//! - `%streamFileDir%` - HLS output directory (segmented streams only)
//! - `%streamNum%` - numeric stream id (segmented streams only)
//!
//! Unknown placeholders are left as they are.

use std::path::{Path, PathBuf};

use crate::StreamId;

pub const FFMPEG_PLACEHOLDER: &str = "%FFMPEG%";
pub const STREAM_FILE_DIR_PLACEHOLDER: &str = "%streamFileDir%";
pub const STREAM_NUM_PLACEHOLDER: &str = "%streamNum%";

/// Replace every occurrence of each placeholder in a single left-to-right pass.
///
/// Replacement text is never rescanned, so the result does not depend on the
/// order of `replacements`. Matching is case-sensitive.
pub fn substitute(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut result = String::with_capacity(template.len() * 2);
    let mut rest = template;

    'scan: while !rest.is_empty() {
        for (placeholder, value) in replacements {
            if !placeholder.is_empty() && rest.starts_with(placeholder) {
                result.push_str(value);
                rest = &rest[placeholder.len()..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            result.push(c);
        }
        rest = chars.as_str();
    }

    result
}

/// Forward slashes keep ffmpeg happy on Windows too.
fn ffmpeg_path_str(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Resolve a command template for one stream.
///
/// `segment_directory` is only given for segmented streams; otherwise the
/// directory and stream number placeholders stay untouched.
pub fn resolve_command(
    template: &str,
    ffmpeg_path: &str,
    segment_directory: Option<&Path>,
    stream_id: StreamId,
) -> String {
    match segment_directory {
        Some(directory) => {
            let directory = ffmpeg_path_str(directory);
            let stream_num = stream_id.to_string();
            substitute(
                template,
                &[
                    (FFMPEG_PLACEHOLDER, ffmpeg_path),
                    (STREAM_FILE_DIR_PLACEHOLDER, &directory),
                    (STREAM_NUM_PLACEHOLDER, &stream_num),
                ],
            )
        }
        None => substitute(template, &[(FFMPEG_PLACEHOLDER, ffmpeg_path)]),
    }
}

/// Manifest path of a segmented stream: `<directory>/stream<id>.<extension>`.
pub fn segment_output_path(directory: &Path, stream_id: StreamId, extension: &str) -> PathBuf {
    directory.join(format!("stream{stream_id}.{extension}"))
}
