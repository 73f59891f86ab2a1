//! Upstream tuner client.

use async_trait::async_trait;
use futures::TryStreamExt;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::{ByteReader, ChannelId, Error, Result};

/// Opens live byte streams for broadcast channels.
///
/// Dropping the returned reader cancels the upstream request.
#[async_trait]
pub trait TunerClient: Send + Sync {
    async fn open_service_stream(&self, channel_id: ChannelId, priority: i32) -> Result<ByteReader>;
}

/// Tuner client speaking the Mirakurun HTTP API.
pub struct MirakurunClient {
    base_url: String,
    client: reqwest::Client,
}

impl MirakurunClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // No request timeout: live streams stay open indefinitely.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .user_agent(concat!("livestream/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn service_stream_url(&self, channel_id: ChannelId) -> String {
        format!("{}/api/services/{}/stream?decode=1", self.base_url, channel_id)
    }
}

#[async_trait]
impl TunerClient for MirakurunClient {
    async fn open_service_stream(&self, channel_id: ChannelId, priority: i32) -> Result<ByteReader> {
        let url = self.service_stream_url(channel_id);
        debug!(%url, priority, "Requesting service stream");

        let response = self
            .client
            .get(&url)
            .header("X-Mirakurun-Priority", priority.to_string())
            .send()
            .await
            .map_err(|e| Error::SourceAcquisition(format!("{channel_id}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SourceAcquisition(format!(
                "{channel_id}: tuner responded with {status}"
            )));
        }

        info!(channel_id, "Service stream opened");
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}
