use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::engine::AnalysisEngine;
use crate::error::SchedulingError;
use crate::types::{CapabilitySummary, DatasetRef, JobId, JobSnapshot, JobState};

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_capabilities(
    State(engine): State<Arc<AnalysisEngine>>,
) -> Json<Vec<CapabilitySummary>> {
    Json(engine.list_capabilities())
}

pub async fn describe_capability(
    State(engine): State<Arc<AnalysisEngine>>,
    Path(name): Path<String>,
) -> Result<Json<CapabilitySummary>, ApiError> {
    engine
        .describe_capability(&name)
        .map(Json)
        .ok_or_else(|| ApiError::Scheduling(SchedulingError::UnknownCapability(name)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub capability: String,
    #[serde(default)]
    pub parameters: Value,
    pub dataset: DatasetRef,
    pub deadline_ms: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub initial_state: JobState,
}

pub async fn submit_job(
    State(engine): State<Arc<AnalysisEngine>>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let deadline = request.deadline_ms.map(Duration::from_millis);
    let job_id = engine.submit(
        &request.capability,
        request.parameters,
        request.dataset,
        deadline,
    )?;
    let initial_state = engine.get_status(job_id)?.state;
    Ok(Json(SubmitJobResponse {
        job_id,
        initial_state,
    }))
}

pub async fn get_job(
    State(engine): State<Arc<AnalysisEngine>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(engine.get_status(job_id)?))
}

pub async fn cancel_job(
    State(engine): State<Arc<AnalysisEngine>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobSnapshot>, ApiError> {
    engine.cancel(job_id)?;
    Ok(Json(engine.get_status(job_id)?))
}
