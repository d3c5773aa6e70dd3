use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;
use crate::store::DeviceRecord;

use super::auth::authorize;
use super::{ApiError, ApiResult, AuthToken};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub device_fingerprint: String,
    pub device_name: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceStatusRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub online: bool,
    pub last_active: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub device: DeviceView,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceView>,
}

impl From<DeviceRecord> for DeviceView {
    fn from(record: DeviceRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            fingerprint: record.fingerprint,
            online: record.online,
            last_active: record.last_active.timestamp_millis(),
        }
    }
}

/// POST /device/register: upsert by fingerprint; registering marks the
/// device online.
pub async fn register(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<RegisterDeviceRequest>,
) -> ApiResult<DeviceResponse> {
    let identity = authorize(&state, &token)?;

    if request.device_fingerprint.trim().is_empty() || request.device_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "deviceFingerprint and deviceName are required".into(),
        ));
    }

    let now = Utc::now();
    let record = match state
        .store
        .find_device_by_fingerprint(&request.device_fingerprint)
        .await?
    {
        Some(mut device) => {
            device.user_id = identity.user_id.clone();
            device.name = request.device_name;
            if let Some(agent) = request.user_agent {
                device.user_agent = agent;
            }
            device.online = true;
            device.last_active = now;
            state.store.put_device(&device).await?;
            device
        }
        None => {
            let device = DeviceRecord {
                id: Uuid::new_v4().to_string(),
                user_id: identity.user_id.clone(),
                fingerprint: request.device_fingerprint,
                name: request.device_name,
                user_agent: request.user_agent.unwrap_or_default(),
                online: true,
                last_active: now,
            };
            state.store.put_device(&device).await?;
            device
        }
    };

    Ok(Json(DeviceResponse {
        device: record.into(),
    }))
}

/// GET /device/list
pub async fn list(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<DeviceListResponse> {
    let identity = authorize(&state, &token)?;
    let devices = state.store.list_devices_by_user(&identity.user_id).await?;
    Ok(Json(DeviceListResponse {
        devices: devices.into_iter().map(DeviceView::from).collect(),
    }))
}

/// PATCH /device/:id/status: online heartbeat / offline signal.
pub async fn update_status(
    State(state): State<AppState>,
    token: AuthToken,
    Path(device_id): Path<String>,
    Json(request): Json<DeviceStatusRequest>,
) -> ApiResult<DeviceResponse> {
    let identity = authorize(&state, &token)?;

    let device = state
        .store
        .get_device(&device_id)
        .await?
        .ok_or(ApiError::NotFound("device"))?;
    if device.user_id != identity.user_id {
        return Err(ApiError::NotFound("device"));
    }

    let record = state
        .store
        .set_device_online(&device_id, request.online, Utc::now())
        .await?;

    Ok(Json(DeviceResponse {
        device: record.into(),
    }))
}
