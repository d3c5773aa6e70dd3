//! Session lifecycle engine: creation, joining, validity, termination.
//!
//! Sessions move `pending → active → ended`, or drop out sideways to
//! `expired` when their deadline passes. Both terminal states are one-way;
//! they differ only for reporting. All transitions go through the store's
//! compare-and-set operations so concurrent callers cannot double-apply
//! them.

use chrono::{Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use skylight_proto::{Permissions, SessionKind, SessionStatus};

use crate::auth::Identity;
use crate::store::{AttachOutcome, DeviceRecord, ExpireOutcome, SessionRecord, Store, StoreError};

const TOKEN_SUFFIX_LEN: usize = 24;
const INSERT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("not authorized: {0}")]
    Unauthorized(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Clone)]
pub struct SessionEngine {
    store: Store,
}

impl SessionEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create an ad hoc, token-shared, time-bounded session. The returned
    /// token doubles as the QR payload; rendering is the caller's concern.
    pub async fn create_instant(
        &self,
        identity: &Identity,
        owner_device_id: &str,
        permissions: Permissions,
        ttl: Duration,
    ) -> Result<SessionRecord, SessionError> {
        let device = self.owned_device(identity, owner_device_id).await?;
        let now = Utc::now();

        let record = self
            .insert_fresh(SessionKind::Instant, |token, room_id| SessionRecord {
                id: Uuid::new_v4().to_string(),
                token,
                kind: SessionKind::Instant,
                owner_id: identity.user_id.clone(),
                owner_device_id: device.id.clone(),
                controller_id: None,
                controller_device_id: None,
                permissions,
                status: SessionStatus::Pending,
                room_id,
                created_at: now,
                expires_at: Some(now + ttl),
                started_at: None,
                ended_at: None,
            })
            .await?;

        info!(
            session = %record.id,
            room = %record.room_id,
            "instant session created"
        );
        Ok(record)
    }

    /// Create a standing-access session against a trust grant. Stays
    /// `pending` unless the grant auto-approves, in which case it starts
    /// `active` right away. Never expires on its own.
    pub async fn create_permanent(
        &self,
        identity: &Identity,
        owner_device_id: &str,
        controller_device_id: &str,
    ) -> Result<SessionRecord, SessionError> {
        let owner_device = self
            .store
            .get_device(owner_device_id)
            .await?
            .ok_or(SessionError::NotFound("device"))?;

        let grants = self
            .store
            .list_grants_for_controller(&identity.email, &identity.user_id)
            .await?;
        let grant = grants
            .into_iter()
            .find(|grant| grant.is_active && grant.owner_device_id == owner_device.id)
            .ok_or(SessionError::Unauthorized("no active trust grant"))?;

        if !owner_device.online {
            return Err(SessionError::InvalidState("owner device is offline"));
        }
        let controller_device = self.owned_device(identity, controller_device_id).await?;

        let now = Utc::now();
        let auto_approve = grant.permissions.auto_approve;
        let record = self
            .insert_fresh(SessionKind::Permanent, |token, room_id| SessionRecord {
                id: Uuid::new_v4().to_string(),
                token,
                kind: SessionKind::Permanent,
                owner_id: grant.owner_id.clone(),
                owner_device_id: owner_device.id.clone(),
                controller_id: Some(identity.user_id.clone()),
                controller_device_id: Some(controller_device.id.clone()),
                permissions: grant.permissions.session_permissions(),
                status: if auto_approve {
                    SessionStatus::Active
                } else {
                    SessionStatus::Pending
                },
                room_id,
                created_at: now,
                expires_at: None,
                started_at: auto_approve.then_some(now),
                ended_at: None,
            })
            .await?;

        self.store
            .mark_grant_used(&grant.id, &identity.user_id, now)
            .await?;

        info!(
            session = %record.id,
            grant = %grant.id,
            auto_approve,
            "permanent session created"
        );
        Ok(record)
    }

    /// Attach the calling controller to a pending session addressed by its
    /// capability token. A second controller, concurrent or late, gets
    /// `Conflict`, never a silent overwrite.
    pub async fn join(
        &self,
        identity: &Identity,
        token: &str,
        controller_device_id: &str,
    ) -> Result<SessionRecord, SessionError> {
        let record = self
            .store
            .find_session_by_token(token)
            .await?
            .ok_or(SessionError::NotFound("session"))?;

        if !self.is_valid(&record).await? {
            return Err(SessionError::InvalidState("session expired or invalid"));
        }

        let device = self.owned_device(identity, controller_device_id).await?;

        match self
            .store
            .attach_controller(&record.id, &identity.user_id, &device.id, Utc::now())
            .await
        {
            Ok(AttachOutcome::Attached(record)) => {
                info!(session = %record.id, controller = %identity.user_id, "session joined");
                Ok(record)
            }
            Ok(AttachOutcome::ControllerPresent) => {
                Err(SessionError::Conflict("controller already attached"))
            }
            Ok(AttachOutcome::NotJoinable) => {
                Err(SessionError::InvalidState("session is not joinable"))
            }
            Err(StoreError::NotFound) => Err(SessionError::NotFound("session")),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a session can still be joined or signaled. Lazily applies
    /// the expiry transition when the deadline has passed; the transition
    /// is a compare-and-set, so concurrent callers race harmlessly and the
    /// losers just observe the terminal status.
    pub async fn is_valid(&self, record: &SessionRecord) -> Result<bool, SessionError> {
        if record.status.is_terminal() {
            return Ok(false);
        }
        if let Some(expires_at) = record.expires_at {
            let now = Utc::now();
            if expires_at <= now {
                match self.store.expire_if_due(&record.id, now).await {
                    Ok(ExpireOutcome::Expired) => {
                        info!(session = %record.id, "session expired");
                    }
                    Ok(_) => {}
                    // reaped concurrently; it is invalid either way
                    Err(StoreError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// End a session on behalf of its owner or attached controller.
    /// Ending an already-terminal session is a no-op success.
    pub async fn end(
        &self,
        identity: &Identity,
        session_id: &str,
    ) -> Result<SessionRecord, SessionError> {
        let record = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound("session"))?;

        let requester = identity.user_id.as_str();
        let is_party = record.owner_id == requester
            || record.controller_id.as_deref() == Some(requester);
        if !is_party {
            return Err(SessionError::Unauthorized(
                "requester is not a session party",
            ));
        }

        if record.status.is_terminal() {
            return Ok(record);
        }

        let record = self.store.end_session(session_id, Utc::now()).await?;
        info!(session = %record.id, by = %requester, "session ended");
        Ok(record)
    }

    /// Active sessions in which the identity participates on either side.
    pub async fn list_active(
        &self,
        identity: &Identity,
    ) -> Result<Vec<SessionRecord>, SessionError> {
        let requester = identity.user_id.as_str();
        let mut sessions = self.store.list_sessions().await?;
        sessions.retain(|record| {
            record.status == SessionStatus::Active
                && (record.owner_id == requester
                    || record.controller_id.as_deref() == Some(requester))
        });
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Resolve a relay join key (session id or room id) to its session.
    pub async fn resolve_room(&self, key: &str) -> Result<SessionRecord, SessionError> {
        if let Some(record) = self.store.get_session(key).await? {
            return Ok(record);
        }
        self.store
            .find_session_by_room(key)
            .await?
            .ok_or(SessionError::NotFound("session"))
    }

    async fn owned_device(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<DeviceRecord, SessionError> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or(SessionError::NotFound("device"))?;
        if device.user_id != identity.user_id {
            // ownership is not leaked to other accounts
            return Err(SessionError::NotFound("device"));
        }
        Ok(device)
    }

    /// Insert with fresh identifiers, regenerating on the (unlikely)
    /// collision of a token or room id. Tokens are never reused.
    async fn insert_fresh(
        &self,
        kind: SessionKind,
        build: impl Fn(String, String) -> SessionRecord,
    ) -> Result<SessionRecord, SessionError> {
        for attempt in 0..INSERT_ATTEMPTS {
            let record = build(generate_token(kind), generate_room_id());
            match self.store.insert_session(&record).await {
                Ok(()) => return Ok(record),
                Err(StoreError::Duplicate) if attempt + 1 < INSERT_ATTEMPTS => continue,
                Err(StoreError::Duplicate) => {
                    return Err(SessionError::Conflict("identifier collision"))
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SessionError::Conflict("identifier collision"))
    }
}

/// Type-tagged, unguessable capability token (`inst_…`/`perm_…`).
pub fn generate_token(kind: SessionKind) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}_{}", kind.token_prefix(), suffix)
}

/// Room identifier, independent of the session's own id.
pub fn generate_room_id() -> String {
    format!("room_{}", Uuid::new_v4())
}
