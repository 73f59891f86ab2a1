//! Application configuration loaded from the environment.
//!
//! Values come from process environment variables, optionally seeded from a
//! `.env` file by the binary (`dotenvy`). Every setting has a default so the
//! service starts with no configuration at all.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:livestream.db?mode=rwc";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8888";
const DEFAULT_MIRAKURUN_URL: &str = "http://127.0.0.1:40772";
const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
const DEFAULT_STREAM_FILES_DIR: &str = "streamfiles";
const DEFAULT_MANIFEST_EXTENSION: &str = "m3u8";
const DEFAULT_MAX_PROCESSES: usize = 4;
const DEFAULT_SEGMENT_CLEANUP_INTERVAL_SECS: u64 = 30;

/// Prefix of environment variables declaring named transcode presets.
const PRESET_PREFIX: &str = "LIVE_PRESET_";
/// Presets whose name starts with this produce segmented (HLS) output.
const HLS_PRESET_PREFIX: &str = "HLS_";

/// A named transcode command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePreset {
    pub command: String,
    pub hls: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub bind_address: String,
    pub mirakurun_url: String,
    /// Substituted for `%FFMPEG%` in command templates.
    pub ffmpeg_path: String,
    /// Directory HLS manifests and segments are written to.
    pub stream_files_dir: PathBuf,
    pub manifest_extension: String,
    pub max_processes: usize,
    pub segment_cleanup_interval: Duration,
    pub default_priority: i32,
    /// Lower-cased preset name -> preset.
    pub presets: BTreeMap<String, LivePreset>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            mirakurun_url: DEFAULT_MIRAKURUN_URL.to_string(),
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            stream_files_dir: PathBuf::from(DEFAULT_STREAM_FILES_DIR),
            manifest_extension: DEFAULT_MANIFEST_EXTENSION.to_string(),
            max_processes: DEFAULT_MAX_PROCESSES,
            segment_cleanup_interval: Duration::from_secs(DEFAULT_SEGMENT_CLEANUP_INTERVAL_SECS),
            default_priority: 0,
            presets: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load the configuration from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let mut presets = BTreeMap::new();
        for (key, value) in &vars {
            let Some(name) = key.strip_prefix(PRESET_PREFIX) else {
                continue;
            };
            if name.is_empty() || value.trim().is_empty() {
                continue;
            }
            presets.insert(
                name.to_ascii_lowercase(),
                LivePreset {
                    command: value.trim().to_string(),
                    hls: name.starts_with(HLS_PRESET_PREFIX),
                },
            );
        }

        let max_processes: usize = parse_var(&get, "MAX_ENCODE_PROCESSES", defaults.max_processes)?;
        if max_processes == 0 {
            return Err(Error::config("MAX_ENCODE_PROCESSES must be at least 1"));
        }

        let cleanup_secs: u64 = parse_var(
            &get,
            "SEGMENT_CLEANUP_INTERVAL_SECS",
            DEFAULT_SEGMENT_CLEANUP_INTERVAL_SECS,
        )?;
        if cleanup_secs == 0 {
            return Err(Error::config("SEGMENT_CLEANUP_INTERVAL_SECS must be at least 1"));
        }

        Ok(Self {
            database_url: get("DATABASE_URL").map_or(defaults.database_url, String::from),
            log_dir: get("LOG_DIR").map_or(defaults.log_dir, PathBuf::from),
            bind_address: get("BIND_ADDRESS").map_or(defaults.bind_address, String::from),
            mirakurun_url: get("MIRAKURUN_URL")
                .map_or(defaults.mirakurun_url, |v| v.trim_end_matches('/').to_string()),
            ffmpeg_path: get("FFMPEG_PATH").map_or(defaults.ffmpeg_path, String::from),
            stream_files_dir: get("STREAM_FILES_DIR").map_or(defaults.stream_files_dir, PathBuf::from),
            manifest_extension: get("HLS_MANIFEST_EXTENSION")
                .map_or(defaults.manifest_extension, |v| v.trim_start_matches('.').to_string()),
            max_processes,
            segment_cleanup_interval: Duration::from_secs(cleanup_secs),
            default_priority: parse_var(&get, "STREAM_PRIORITY", defaults.default_priority)?,
            presets,
        })
    }

    /// Look up a preset by name, case-insensitively.
    pub fn preset(&self, name: &str) -> Option<&LivePreset> {
        self.presets.get(&name.to_ascii_lowercase())
    }
}

fn parse_var<'a, T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<&'a str>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {key} ({raw:?}): {e}"))),
        None => Ok(default),
    }
}
