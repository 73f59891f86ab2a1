//! Integration tests for the HTTP router.
//!
//! The tuner points at a closed local port, so every stream start fails at
//! source acquisition; no ffmpeg binary is needed.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use livestream::api::{ApiServer, AppState};
use livestream::config::AppConfig;
use livestream::logging::LoggingConfig;
use livestream::process::FfmpegProcessManager;
use livestream::stream::{SessionContext, StreamManager};
use livestream::tuner::MirakurunClient;

fn state() -> AppState {
    let vars = [
        ("MIRAKURUN_URL", "http://127.0.0.1:9"),
        ("LIVE_PRESET_H264", "%FFMPEG% -i pipe:0 -c:v libx264 -f mpegts pipe:1"),
        (
            "LIVE_PRESET_HLS_720P",
            "%FFMPEG% -i pipe:0 -f hls %streamFileDir%/stream%streamNum%.m3u8",
        ),
    ];
    let config = Arc::new(
        AppConfig::from_vars(vars.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap(),
    );
    let tuner = Arc::new(MirakurunClient::new(config.mirakurun_url.clone()).unwrap());
    let processes = Arc::new(FfmpegProcessManager::new(config.max_processes));
    let manager = Arc::new(StreamManager::new(
        SessionContext::new(&config, tuner, processes),
        std::env::temp_dir().join("livestream-api-test"),
        config.default_priority,
    ));
    AppState::new(manager, config)
}

fn app() -> Router {
    ApiServer::new("127.0.0.1:0", state()).build_router()
}

async fn send(method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    call(app(), request).await
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_list_streams_empty() {
    let (status, body) = send(Method::GET, "/api/streams").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn test_unknown_stream_is_not_found() {
    let (status, body) = send(Method::GET, "/api/streams/5").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(Method::DELETE, "/api/streams/5").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_all_without_streams() {
    let (status, body) = send(Method::DELETE, "/api/streams").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], 0);
}

#[tokio::test]
async fn test_unknown_preset_is_not_found() {
    let (status, _) = send(Method::GET, "/api/streams/live/1/mpegts?preset=nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_preset_kind_must_match_route() {
    let (status, _) = send(Method::GET, "/api/streams/live/1/mpegts?preset=hls_720p").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(Method::POST, "/api/streams/live/1/hls?preset=h264").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(Method::POST, "/api/streams/live/1/hls").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_tuner_is_bad_gateway() {
    let (status, body) = send(Method::GET, "/api/streams/live/1/mpegts").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "SOURCE_UNAVAILABLE");

    let (status, _) = send(Method::POST, "/api/streams/live/1/hls?preset=HLS_720P").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activeStreams"], 0);
}

#[tokio::test]
async fn test_logging_without_config_is_internal_error() {
    let (status, body) = send(Method::GET, "/api/logging").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INTERNAL_ERROR");
}

#[tokio::test]
async fn test_update_log_filter() {
    let (_layer, handle) =
        reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("livestream=info"));
    let logging = Arc::new(LoggingConfig::new(handle, "/var/log/livestream"));
    let router = ApiServer::new("127.0.0.1:0", state().with_logging(logging.clone())).build_router();

    let get = Request::get("/api/logging").body(Body::empty()).unwrap();
    let (status, body) = call(router.clone(), get).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filter"], "livestream=info");
    assert_eq!(body["logDir"], "/var/log/livestream");

    let put = Request::put("/api/logging")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"filter":"livestream=debug"}"#))
        .unwrap();
    let (status, body) = call(router.clone(), put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filter"], "livestream=debug");
    assert_eq!(logging.get_filter(), "livestream=debug");

    let invalid = Request::put("/api/logging")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"filter":"livestream=loud"}"#))
        .unwrap();
    let (status, _) = call(router, invalid).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(logging.get_filter(), "livestream=debug");
}
