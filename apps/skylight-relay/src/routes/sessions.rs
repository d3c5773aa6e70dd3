use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;

use skylight_proto::{Permissions, SessionKind, SessionStatus};

use crate::audit::{self, AuditEvent};
use crate::state::AppState;
use crate::store::SessionRecord;

use super::{ApiError, ApiResult, AuthToken};
use super::auth::authorize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstantRequest {
    pub owner_device_id: String,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    /// Optional override of the configured default, clamped to the
    /// configured maximum.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub token: String,
    pub controller_device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermanentRequest {
    pub owner_device_id: String,
    pub controller_device_id: String,
}

/// The creation view is the only place the capability token (and with it
/// the QR payload) ever leaves the broker.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSessionView {
    pub id: String,
    pub token: String,
    /// The token string, ready to be rendered into a QR code by the
    /// client.
    pub qr_payload: String,
    pub room_id: String,
    pub status: SessionStatus,
    pub permissions: Permissions,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub room_id: String,
    pub owner_id: String,
    pub owner_device_id: String,
    pub controller_id: Option<String>,
    pub controller_device_id: Option<String>,
    pub permissions: Permissions,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreatedSessionResponse {
    pub session: CreatedSessionView,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: SessionView,
}

#[derive(Debug, Serialize)]
pub struct ActiveSessionsResponse {
    pub sessions: Vec<SessionView>,
}

impl From<SessionRecord> for SessionView {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status,
            room_id: record.room_id,
            owner_id: record.owner_id,
            owner_device_id: record.owner_device_id,
            controller_id: record.controller_id,
            controller_device_id: record.controller_device_id,
            permissions: record.permissions,
            created_at: record.created_at.timestamp_millis(),
            started_at: record.started_at.map(|at| at.timestamp_millis()),
            expires_at: record.expires_at.map(|at| at.timestamp_millis()),
        }
    }
}

impl From<SessionRecord> for CreatedSessionView {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            qr_payload: record.token.clone(),
            token: record.token,
            room_id: record.room_id,
            status: record.status,
            permissions: record.permissions,
            expires_at: record.expires_at.map(|at| at.timestamp_millis()),
        }
    }
}

/// POST /session/instant
pub async fn create_instant(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<CreateInstantRequest>,
) -> ApiResult<CreatedSessionResponse> {
    let identity = authorize(&state, &token)?;

    let ttl_seconds = request
        .ttl_seconds
        .unwrap_or(state.config.instant_ttl_seconds)
        .min(state.config.max_instant_ttl_seconds);
    if ttl_seconds == 0 {
        return Err(ApiError::BadRequest("ttlSeconds must be positive".into()));
    }

    let record = state
        .engine
        .create_instant(
            &identity,
            &request.owner_device_id,
            request.permissions.unwrap_or_default(),
            Duration::seconds(ttl_seconds as i64),
        )
        .await?;

    audit::record(
        AuditEvent::new("session_created")
            .user(&identity.user_id)
            .session(&record.id)
            .device(&request.owner_device_id)
            .data(json!({ "sessionType": "instant", "ttlSeconds": ttl_seconds })),
    );

    Ok(Json(CreatedSessionResponse {
        session: record.into(),
    }))
}

/// POST /session/join
pub async fn join(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<JoinRequest>,
) -> ApiResult<SessionResponse> {
    let identity = authorize(&state, &token)?;

    let record = state
        .engine
        .join(&identity, &request.token, &request.controller_device_id)
        .await?;

    audit::record(
        AuditEvent::new("session_joined")
            .user(&identity.user_id)
            .session(&record.id)
            .device(&request.controller_device_id)
            .data(json!({})),
    );

    Ok(Json(SessionResponse {
        session: record.into(),
    }))
}

/// POST /session/permanent
pub async fn create_permanent(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<CreatePermanentRequest>,
) -> ApiResult<SessionResponse> {
    let identity = authorize(&state, &token)?;

    let record = state
        .engine
        .create_permanent(
            &identity,
            &request.owner_device_id,
            &request.controller_device_id,
        )
        .await?;

    audit::record(
        AuditEvent::new("session_created")
            .user(&identity.user_id)
            .session(&record.id)
            .device(&request.controller_device_id)
            .data(json!({
                "sessionType": "permanent",
                "ownerDeviceId": request.owner_device_id,
            })),
    );

    Ok(Json(SessionResponse {
        session: record.into(),
    }))
}

/// DELETE /session/:id
pub async fn end(
    State(state): State<AppState>,
    token: AuthToken,
    Path(session_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let identity = authorize(&state, &token)?;

    let record = state.engine.end(&identity, &session_id).await?;

    audit::record(
        AuditEvent::new("session_ended")
            .user(&identity.user_id)
            .session(&record.id)
            .data(json!({})),
    );

    Ok(Json(json!({ "ended": true })))
}

/// GET /session/active
pub async fn list_active(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<ActiveSessionsResponse> {
    let identity = authorize(&state, &token)?;
    let sessions = state.engine.list_active(&identity).await?;
    Ok(Json(ActiveSessionsResponse {
        sessions: sessions.into_iter().map(SessionView::from).collect(),
    }))
}
