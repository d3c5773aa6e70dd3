pub mod auth;
mod devices;
mod sessions;
mod trust;

use axum::{
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::session::SessionError;
use crate::state::AppState;
use crate::store::StoreError;
use crate::trust::TrustError;

pub use auth::AuthToken;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/session/instant", post(sessions::create_instant))
        .route("/session/join", post(sessions::join))
        .route("/session/permanent", post(sessions::create_permanent))
        .route("/session/active", get(sessions::list_active))
        .route("/session/:session_id", delete(sessions::end))
        .route("/trust/add", post(trust::add))
        .route("/trust/list", get(trust::list))
        .route("/trust/available-devices", get(trust::available_devices))
        .route("/trust/:grant_id", delete(trust::revoke))
        .route("/device/register", post(devices::register))
        .route("/device/list", get(devices::list))
        .route("/device/:device_id/status", patch(devices::update_status))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Stable failure taxonomy of the management surface. Everything the
/// engine or ledger can report maps onto one of these; bodies carry a
/// machine-readable kind plus a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    InvalidState(&'static str),
    BadRequest(String),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthorized => (axum::http::StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Forbidden(msg) => (
                axum::http::StatusCode::FORBIDDEN,
                "forbidden",
                Some(msg.to_string()),
            ),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                "not_found",
                Some(msg.to_string()),
            ),
            ApiError::Conflict(msg) => (
                axum::http::StatusCode::CONFLICT,
                "conflict",
                Some(msg.to_string()),
            ),
            ApiError::InvalidState(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                "invalid_state",
                Some(msg.to_string()),
            ),
            ApiError::BadRequest(msg) => {
                (axum::http::StatusCode::BAD_REQUEST, "bad_request", Some(msg))
            }
            ApiError::Internal => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                None,
            ),
        };
        (status, Json(ApiErrorBody { error: kind, message })).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(what) => ApiError::NotFound(what),
            SessionError::Unauthorized(msg) => ApiError::Forbidden(msg),
            SessionError::InvalidState(msg) => ApiError::InvalidState(msg),
            SessionError::Conflict(msg) => ApiError::Conflict(msg),
            SessionError::Storage(err) => {
                error!(error = %err, "storage failure");
                ApiError::Internal
            }
        }
    }
}

impl From<TrustError> for ApiError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::NotFound(what) => ApiError::NotFound(what),
            TrustError::Conflict(msg) => ApiError::Conflict(msg),
            TrustError::Storage(err) => {
                error!(error = %err, "storage failure");
                ApiError::Internal
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("record"),
            StoreError::Duplicate => ApiError::Conflict("duplicate record"),
            other => {
                error!(error = %other, "storage failure");
                ApiError::Internal
            }
        }
    }
}
