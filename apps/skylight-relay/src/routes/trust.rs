use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use skylight_proto::GrantPermissions;

use crate::audit::{self, AuditEvent};
use crate::state::AppState;
use crate::store::TrustGrantRecord;
use crate::trust::AvailableDevice;

use super::auth::authorize;
use super::devices::DeviceView;
use super::{ApiResult, AuthToken};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTrustRequest {
    pub controller_email: String,
    pub owner_device_id: String,
    #[serde(default)]
    pub permissions: Option<GrantPermissions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantView {
    pub id: String,
    pub owner_device_id: String,
    pub controller_email: String,
    pub permissions: GrantPermissions,
    pub is_active: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub grant: GrantView,
}

#[derive(Debug, Serialize)]
pub struct GrantListResponse {
    pub grants: Vec<GrantView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableDeviceView {
    pub trust_id: String,
    pub device: DeviceView,
    pub owner_id: String,
    pub permissions: GrantPermissions,
    pub last_used: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableDevicesResponse {
    pub available_devices: Vec<AvailableDeviceView>,
}

impl From<TrustGrantRecord> for GrantView {
    fn from(record: TrustGrantRecord) -> Self {
        Self {
            id: record.id,
            owner_device_id: record.owner_device_id,
            controller_email: record.controller_email,
            permissions: record.permissions,
            is_active: record.is_active,
            created_at: record.created_at.timestamp_millis(),
            last_used_at: record.last_used_at.map(|at| at.timestamp_millis()),
        }
    }
}

impl From<AvailableDevice> for AvailableDeviceView {
    fn from(entry: AvailableDevice) -> Self {
        Self {
            trust_id: entry.grant_id,
            device: entry.device.into(),
            owner_id: entry.owner_id,
            permissions: entry.permissions,
            last_used: entry.last_used_at.map(|at| at.timestamp_millis()),
        }
    }
}

/// POST /trust/add
pub async fn add(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<AddTrustRequest>,
) -> ApiResult<GrantResponse> {
    let identity = authorize(&state, &token)?;

    let record = state
        .ledger
        .grant(
            &identity,
            &request.owner_device_id,
            &request.controller_email,
            request.permissions.unwrap_or_default(),
        )
        .await?;

    audit::record(
        AuditEvent::new("trust_added")
            .user(&identity.user_id)
            .device(&request.owner_device_id)
            .data(json!({ "controllerEmail": record.controller_email.clone() })),
    );

    Ok(Json(GrantResponse {
        grant: record.into(),
    }))
}

/// GET /trust/list
pub async fn list(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<GrantListResponse> {
    let identity = authorize(&state, &token)?;
    let grants = state.ledger.list(&identity).await?;
    Ok(Json(GrantListResponse {
        grants: grants.into_iter().map(GrantView::from).collect(),
    }))
}

/// DELETE /trust/:id
pub async fn revoke(
    State(state): State<AppState>,
    token: AuthToken,
    Path(grant_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let identity = authorize(&state, &token)?;

    state.ledger.revoke(&identity, &grant_id).await?;

    audit::record(
        AuditEvent::new("trust_revoked")
            .user(&identity.user_id)
            .data(json!({ "grantId": grant_id })),
    );

    Ok(Json(json!({ "revoked": true })))
}

/// GET /trust/available-devices
pub async fn available_devices(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<AvailableDevicesResponse> {
    let identity = authorize(&state, &token)?;
    let entries = state.ledger.resolve_available(&identity).await?;
    Ok(Json(AvailableDevicesResponse {
        available_devices: entries.into_iter().map(AvailableDeviceView::from).collect(),
    }))
}
