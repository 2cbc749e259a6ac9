use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{RegistrationError, SchedulingError};

/// HTTP rendering of the core error taxonomy. Every response body carries
/// the stable machine-readable kind next to the human-readable message.
#[derive(Debug)]
pub enum ApiError {
    Scheduling(SchedulingError),
    Registration(RegistrationError),
    BadRequest(String),
}

impl From<SchedulingError> for ApiError {
    fn from(err: SchedulingError) -> Self {
        ApiError::Scheduling(err)
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        ApiError::Registration(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::Scheduling(e) => {
                let status = match e {
                    SchedulingError::UnknownCapability(_) | SchedulingError::UnknownJob(_) => {
                        StatusCode::NOT_FOUND
                    }
                    SchedulingError::SchedulerSaturated(_) => StatusCode::TOO_MANY_REQUESTS,
                };
                (status, e.kind(), e.to_string())
            }
            ApiError::Registration(e) => {
                let status = match e {
                    RegistrationError::DuplicateCapability(_) => StatusCode::CONFLICT,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, e.kind(), e.to_string())
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "bad_request", message.clone())
            }
        };
        (
            status,
            Json(json!({ "error": { "kind": kind, "message": message } })),
        )
            .into_response()
    }
}
