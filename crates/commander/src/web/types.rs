use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::TokenAuthority;
use crate::dispatcher::Dispatcher;
use crate::error::MissionError;
use crate::ledger::{MissionLedger, StatusEvent};
use crate::metrics::Metrics;

pub const SECRET_HEADER: &str = "x-secret";
pub const SOLDIER_HEADER: &str = "x-soldier";

// Application state
#[derive(Clone)]
pub struct WebState {
    pub dispatcher: Arc<Dispatcher>,
    pub authority: Arc<TokenAuthority>,
    pub ledger: Arc<MissionLedger>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub payload: String,
    #[serde(default, alias = "target_soldier")]
    pub target_worker: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub mission_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub mission_id: String,
    pub events: Vec<StatusEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DigestResponse {
    pub soldier: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

/// Error returned by every handler, rendered as `{"code", "error"}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_json",
            message: message.into(),
        }
    }
}

impl From<MissionError> for ApiError {
    fn from(e: MissionError) -> Self {
        let status = match &e {
            MissionError::Validation(_) => StatusCode::BAD_REQUEST,
            MissionError::Forbidden => StatusCode::FORBIDDEN,
            MissionError::NotFound(_) => StatusCode::NOT_FOUND,
            MissionError::Routing(_)
            | MissionError::Publish(_)
            | MissionError::Encode(_)
            | MissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
