//! Logging routes: read and change the live log filter.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::logging::LoggingConfig;

#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub log_dir: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_logging_config).put(update_logging_config))
}

fn logging_config(state: &AppState) -> ApiResult<&Arc<LoggingConfig>> {
    state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))
}

fn response(logging: &LoggingConfig) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter: logging.get_filter(),
        log_dir: logging.log_dir().display().to_string(),
    }
}

async fn get_logging_config(
    State(state): State<AppState>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let logging = logging_config(&state)?;
    Ok(Json(response(logging)))
}

async fn update_logging_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let logging = logging_config(&state)?;
    logging
        .set_filter(&request.filter)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(response(logging)))
}
