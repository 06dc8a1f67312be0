use crate::error::LateSampleError;
use crate::pipeline::{PipelineHandle, StatusReport};
use crate::telemetry::{Quality, TagSample, TagValue};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: PipelineHandle,
}

#[derive(Debug, Deserialize)]
struct IncomingSample {
    tag: String,
    timestamp: DateTime<Utc>,
    value: TagValue,
    #[serde(default)]
    quality: Quality,
    /// Defaults to the API client id.
    #[serde(default)]
    dataset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SamplesRequest {
    samples: Vec<IncomingSample>,
}

#[derive(Debug, Serialize)]
struct SamplesResponse {
    accepted: u64,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset_requested: bool,
}

#[derive(Debug, Deserialize)]
struct PollingRequest {
    disabled: bool,
}

#[derive(Debug, Serialize)]
struct PollingResponse {
    polling_disabled: bool,
}

#[derive(Debug, Serialize)]
struct ShutdownResponse {
    shutdown_requested: bool,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusReport> {
    Json(state.pipeline.status())
}

async fn post_samples(
    State(state): State<HttpState>,
    Json(payload): Json<SamplesRequest>,
) -> Result<Json<SamplesResponse>, (StatusCode, String)> {
    let client_id = state.pipeline.client_id.clone();
    let mut samples = Vec::with_capacity(payload.samples.len());
    for incoming in payload.samples {
        if incoming.tag.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, "sample tag must not be empty".to_string()));
        }
        let dataset = incoming
            .dataset
            .filter(|dataset| !dataset.trim().is_empty())
            .unwrap_or_else(|| client_id.clone());
        samples.push(TagSample {
            tag_id: incoming.tag,
            timestamp: incoming.timestamp,
            value: incoming.value,
            quality: incoming.quality,
            dataset,
        });
    }

    let store = state.pipeline.store.clone();
    let accepted = tokio::task::spawn_blocking(move || store.append(&samples))
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(|err| {
            if err.downcast_ref::<LateSampleError>().is_some() {
                (StatusCode::CONFLICT, format!("{err:#}"))
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}"))
            }
        })?;
    Ok(Json(SamplesResponse {
        accepted: accepted as u64,
    }))
}

async fn post_reset(State(state): State<HttpState>) -> Json<ResetResponse> {
    state.pipeline.diagnostics.request_reset();
    Json(ResetResponse {
        reset_requested: true,
    })
}

async fn post_polling(
    State(state): State<HttpState>,
    Json(payload): Json<PollingRequest>,
) -> Json<PollingResponse> {
    state.pipeline.controls.set_polling_disabled(payload.disabled);
    Json(PollingResponse {
        polling_disabled: state.pipeline.controls.polling_disabled(),
    })
}

async fn post_shutdown(State(state): State<HttpState>) -> Json<ShutdownResponse> {
    state.pipeline.controls.request_shutdown();
    Json(ShutdownResponse {
        shutdown_requested: true,
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/samples", post(post_samples))
        .route("/v1/diagnostics/reset", post(post_reset))
        .route("/v1/polling", post(post_polling))
        .route("/v1/shutdown", post(post_shutdown))
        .with_state(state)
}
