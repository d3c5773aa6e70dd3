use serde_json::Value;
use tracing::info;

/// Best-effort audit trail. Events are emitted as structured log lines
/// under a dedicated target for a downstream collector to pick up;
/// emission must never fail the operation it is attached to, so there is
/// no error path out of here.
pub struct AuditEvent<'a> {
    pub event_type: &'static str,
    pub user_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub data: Value,
}

impl<'a> AuditEvent<'a> {
    pub fn new(event_type: &'static str) -> Self {
        Self {
            event_type,
            user_id: None,
            session_id: None,
            device_id: None,
            data: Value::Null,
        }
    }

    pub fn user(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn session(mut self, session_id: &'a str) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn device(mut self, device_id: &'a str) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

pub fn record(event: AuditEvent<'_>) {
    let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "null".to_string());
    info!(
        target: "skylight::audit",
        event = event.event_type,
        user = event.user_id.unwrap_or("-"),
        session = event.session_id.unwrap_or("-"),
        device = event.device_id.unwrap_or("-"),
        %data,
        "audit"
    );
}
