//! Live stream routes.
//!
//! - `GET    /api/streams` - list running streams
//! - `GET    /api/streams/{id}` - one stream
//! - `DELETE /api/streams/{id}` - stop one stream
//! - `DELETE /api/streams` - stop all streams
//! - `GET    /api/streams/live/{channel_id}/mpegts` - watch a channel as MPEG-TS
//! - `POST   /api/streams/live/{channel_id}/hls` - start HLS output for a channel

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::LivePreset;
use crate::stream::{LiveStreamInfo, StreamManager};
use crate::{ByteReader, ChannelId, Error, StreamId};

const MPEGTS_CONTENT_TYPE: &str = "video/mp2t";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_streams).delete(stop_all_streams))
        .route("/{id}", get(get_stream).delete(stop_stream))
        .route("/live/{channel_id}/mpegts", get(watch_mpegts))
        .route("/live/{channel_id}/hls", post(start_hls))
}

#[derive(Debug, Deserialize, Default)]
pub struct LiveParams {
    pub preset: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub stream_id: StreamId,
    #[serde(flatten)]
    pub info: LiveStreamInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsStartedResponse {
    pub stream_id: StreamId,
    /// Manifest location relative to the stream files directory.
    pub playlist: String,
}

#[derive(Debug, Serialize)]
pub struct StoppedResponse {
    pub stopped: usize,
}

fn lookup_preset<'a>(state: &'a AppState, name: &str) -> ApiResult<&'a LivePreset> {
    state
        .config
        .preset(name)
        .ok_or_else(|| Error::not_found("Preset", name).into())
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamResponse>> {
    let streams = state
        .manager
        .list()
        .into_iter()
        .map(|(stream_id, info)| StreamResponse { stream_id, info })
        .collect();
    Json(streams)
}

async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> ApiResult<Json<StreamResponse>> {
    let session = state
        .manager
        .get(id)
        .ok_or_else(|| Error::not_found("Stream", id))?;
    Ok(Json(StreamResponse {
        stream_id: id,
        info: session.info(),
    }))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> ApiResult<StatusCode> {
    state.manager.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_all_streams(State(state): State<AppState>) -> Json<StoppedResponse> {
    Json(StoppedResponse {
        stopped: state.manager.stop_all().await,
    })
}

/// Start a passthrough or encoded session and stream it until the client goes away.
async fn watch_mpegts(
    State(state): State<AppState>,
    Path(channel_id): Path<ChannelId>,
    Query(params): Query<LiveParams>,
) -> ApiResult<Response> {
    let preset = match params.preset.as_deref() {
        Some(name) => {
            let preset = lookup_preset(&state, name)?;
            if preset.hls {
                return Err(ApiError::bad_request(format!(
                    "preset '{name}' produces HLS output, use the hls endpoint"
                )));
            }
            Some(preset)
        }
        None => None,
    };

    let option = state.manager.live_option(channel_id, preset);
    let (stream_id, session) = state.manager.start_stream(option).await?;

    let reader = match session.stream() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = state.manager.stop(stream_id).await;
            return Err(e.into());
        }
    };

    let body = Body::from_stream(SessionBody {
        inner: ReaderStream::new(reader),
        manager: state.manager.clone(),
        stream_id,
    });
    Ok(([(header::CONTENT_TYPE, MPEGTS_CONTENT_TYPE)], body).into_response())
}

async fn start_hls(
    State(state): State<AppState>,
    Path(channel_id): Path<ChannelId>,
    Query(params): Query<LiveParams>,
) -> ApiResult<(StatusCode, Json<HlsStartedResponse>)> {
    let name = params
        .preset
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("an HLS preset is required"))?;
    let preset = lookup_preset(&state, name)?;
    if !preset.hls {
        return Err(ApiError::bad_request(format!(
            "preset '{name}' does not produce HLS output"
        )));
    }

    let option = state.manager.live_option(channel_id, Some(preset));
    let (stream_id, _) = state.manager.start_stream(option).await?;

    Ok((
        StatusCode::CREATED,
        Json(HlsStartedResponse {
            stream_id,
            playlist: format!("stream{}.{}", stream_id, state.config.manifest_extension),
        }),
    ))
}

/// Response body of a live stream. Dropping it, which happens when the client
/// disconnects, stops the session.
struct SessionBody {
    inner: ReaderStream<ByteReader>,
    manager: Arc<StreamManager>,
    stream_id: StreamId,
}

impl Stream for SessionBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SessionBody {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let stream_id = self.stream_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                // Already gone if it ended on its own.
                if manager.stop(stream_id).await.is_ok() {
                    debug!(stream_id, "Client disconnected, stream stopped");
                }
            });
        }
    }
}
