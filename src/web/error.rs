use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use super::backups::location;
use crate::core::RecordError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid json document")]
    InvalidJson(#[source] serde_json::Error),
    #[error(transparent)]
    InvalidRequest(#[from] RecordError),
    #[error("backup in progress")]
    Conflict { label: String },
    #[error("backup not found")]
    NotFound,
    #[error("shutting down, not accepting backups")]
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));

        match self {
            Self::InvalidJson(_) | Self::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            Self::Conflict { label } => (
                StatusCode::CONFLICT,
                [(header::LOCATION, location(&label))],
                body,
            )
                .into_response(),
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, body).into_response(),
        }
    }
}
