//! Live TV stream orchestration.
//!
//! Acquires a broadcast channel from the tuner, optionally pipes it through a
//! transcoding process (plain or segmented HLS output) and hands the result
//! to HTTP clients.

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod process;
pub mod segment;
pub mod stream;
pub mod tuner;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};

/// Tuner channel (service) identifier.
pub type ChannelId = u64;

/// Caller-assigned identifier of a live stream session.
pub type StreamId = u32;

/// Owned, readable byte stream.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Owned, writable byte stream.
pub type ByteWriter = Pin<Box<dyn AsyncWrite + Send>>;
