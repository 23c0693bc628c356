use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::NetworkAddress;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::scheduler::error::SchedulerError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, Json(self)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let message = e.to_string();
        match e {
            SchedulerError::NoBackends => Self::unavailable(&message),
            e if e.is_invalid_request() => Self::bad_request(&message),
            _ => Self::internal_error(&message),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendsList {
    pub backends: Vec<NetworkAddress>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_assignments: u64,
    pub total_local_assignments: u64,
    pub num_backends: u64,
    pub num_backend_hosts: usize,
}
