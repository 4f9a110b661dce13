use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

use super::{ApiError, ApiState};
use crate::core::models::{BackupDetails, BackupSummary, RequestBody};
use crate::core::{BackupRequest, BackupStatus, HistoryStore, JobRecord, StatusFilter};

/// How long a submission waits for the backup to finish before answering
/// 202. Long enough to report a backup that fails right away.
const SUBMIT_WAIT: Duration = Duration::from_secs(1);
const SUBMIT_POLL: Duration = Duration::from_millis(100);

pub fn location(label: &str) -> String {
    format!("/backups/backup/{}", label)
}

fn status_filter(params: &[(String, String)]) -> StatusFilter {
    StatusFilter::from_query(
        params
            .iter()
            .filter(|(key, _)| key == "status")
            .map(|(_, value)| value.as_str()),
    )
}

pub async fn list(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<Vec<BackupSummary>> {
    let records = state.ctx.history.list(&status_filter(&params)).await;
    Json(records.iter().map(JobRecord::summary).collect())
}

pub async fn show(
    State(state): State<ApiState>,
    Path(label): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<BackupDetails>, ApiError> {
    state
        .ctx
        .history
        .find(&label, &status_filter(&params))
        .await
        .map(|record| Json(record.details()))
        .ok_or(ApiError::NotFound)
}

fn parse_body(body: &[u8]) -> Result<Option<RequestBody>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map_err(ApiError::InvalidJson)
}

/// Request a backup. Only one backup runs at a time; while one is in
/// flight every other request gets 409 pointing at it.
pub async fn create(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let body = parse_body(&body)?;

    let mut slot = state.slot.lock().await;
    if let Some(active) = slot.active() {
        return Err(ApiError::Conflict {
            label: active.to_string(),
        });
    }

    let request = BackupRequest::from_body(body)?;
    if state.shutdown.is_cancelled() {
        return Err(ApiError::Unavailable);
    }

    let record = state.ctx.history.register(request).await;
    let label = record.label().to_string();
    if let Err(e) = slot.trigger(&label) {
        error!(label = %label, error = %e, "Could not hand backup to runner");
        state
            .ctx
            .history
            .update(&label, |record| {
                let _ = record.fail_to_start();
            })
            .await;
        return Err(ApiError::Unavailable);
    }
    info!(label = %label, "Backup requested");

    let record = wait_for_result(&state.ctx.history, record).await;
    if record.status().is_terminal() {
        slot.clear(&label);
    }
    drop(slot);

    let details = Json(record.details());
    let response = match record.status() {
        BackupStatus::Finished => (StatusCode::OK, details).into_response(),
        BackupStatus::Error => (StatusCode::INTERNAL_SERVER_ERROR, details).into_response(),
        BackupStatus::Requested | BackupStatus::Running => (
            StatusCode::ACCEPTED,
            [(header::LOCATION, location(&label))],
            details,
        )
            .into_response(),
    };
    Ok(response)
}

/// Poll until the record is terminal or [`SUBMIT_WAIT`] has passed.
async fn wait_for_result(history: &HistoryStore, mut record: JobRecord) -> JobRecord {
    let deadline = Instant::now() + SUBMIT_WAIT;
    loop {
        if let Some(current) = history.get(record.label()).await {
            record = current;
        }
        if record.status().is_terminal() || Instant::now() >= deadline {
            return record;
        }
        tokio::time::sleep(SUBMIT_POLL).await;
    }
}
