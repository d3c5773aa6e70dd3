//! Persistence for sessions, trust grants, and devices.
//!
//! Two backends behind one handle: an in-memory store (tests, single-node
//! development) and Redis (shared deployments). State transitions that must
//! happen at most once (expiry, controller attachment, ending) are
//! compare-and-set: the memory backend runs them under the store's write
//! lock, the Redis backend runs them as server-side Lua scripts because a
//! multiplexed connection manager cannot WATCH.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use skylight_proto::{GrantPermissions, Permissions, SessionKind, SessionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub token: String,
    pub kind: SessionKind,
    pub owner_id: String,
    pub owner_device_id: String,
    pub controller_id: Option<String>,
    pub controller_device_id: Option<String>,
    pub permissions: Permissions,
    pub status: SessionStatus,
    /// Relay room identifier; deliberately unrelated to `id` so a leaked
    /// database key does not name the room.
    pub room_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustGrantRecord {
    pub id: String,
    pub owner_id: String,
    pub owner_device_id: String,
    /// Case-folded at the ledger boundary.
    pub controller_email: String,
    /// Bound lazily the first time the named controller consumes the
    /// grant; grants can be issued to not-yet-registered emails.
    pub controller_id: Option<String>,
    pub permissions: GrantPermissions,
    pub is_active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub user_id: String,
    pub fingerprint: String,
    pub name: String,
    pub user_agent: String,
    pub online: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("duplicate record")]
    Duplicate,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result of the idempotent expiry compare-and-set. At most one caller
/// ever observes `Expired` for a given session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Expired,
    NotDue,
    AlreadyTerminal,
}

/// Result of the controller-attachment compare-and-set.
#[derive(Debug)]
pub enum AttachOutcome {
    Attached(SessionRecord),
    ControllerPresent,
    NotJoinable,
}

#[derive(Clone)]
pub struct Store {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryStore>),
    Redis(RedisStore),
}

impl Store {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryStore::default())),
        }
    }

    pub async fn connect_redis(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(RedisStore::new(conn)),
        })
    }

    // --- sessions ---

    pub async fn insert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.insert_session(record).await,
            Backend::Redis(store) => store.insert_session(record).await,
        }
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.get_session(id).await),
            Backend::Redis(store) => store.get_session(id).await,
        }
    }

    pub async fn find_session_by_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.find_session(|s| s.token == token).await),
            Backend::Redis(store) => store.find_session_by_index(&token_index_key(token)).await,
        }
    }

    pub async fn find_session_by_room(
        &self,
        room_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.find_session(|s| s.room_id == room_id).await),
            Backend::Redis(store) => store.find_session_by_index(&room_index_key(room_id)).await,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.list_sessions().await),
            Backend::Redis(store) => store.list_sessions().await,
        }
    }

    pub async fn expire_if_due(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExpireOutcome, StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.expire_if_due(id, now).await,
            Backend::Redis(store) => store.expire_if_due(id, now).await,
        }
    }

    pub async fn attach_controller(
        &self,
        id: &str,
        controller_id: &str,
        controller_device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AttachOutcome, StoreError> {
        match &self.backend {
            Backend::Memory(store) => {
                store
                    .attach_controller(id, controller_id, controller_device_id, now)
                    .await
            }
            Backend::Redis(store) => {
                store
                    .attach_controller(id, controller_id, controller_device_id, now)
                    .await
            }
        }
    }

    /// Transition a session to `ended`, or return it untouched when it is
    /// already terminal.
    pub async fn end_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.end_session(id, now).await,
            Backend::Redis(store) => store.end_session(id, now).await,
        }
    }

    pub async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.remove_session(id).await,
            Backend::Redis(store) => store.remove_session(id).await,
        }
    }

    // --- trust grants ---

    pub async fn insert_grant(&self, record: &TrustGrantRecord) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.insert_grant(record).await,
            Backend::Redis(store) => store.insert_grant(record).await,
        }
    }

    pub async fn get_grant(&self, id: &str) -> Result<Option<TrustGrantRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.get_grant(id).await),
            Backend::Redis(store) => store.get_grant(id).await,
        }
    }

    pub async fn list_grants_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<TrustGrantRecord>, StoreError> {
        Ok(self
            .list_grants()
            .await?
            .into_iter()
            .filter(|grant| grant.owner_id == owner_id)
            .collect())
    }

    /// Grants addressed to a controller: matched by case-folded email or,
    /// once bound, by account id.
    pub async fn list_grants_for_controller(
        &self,
        email: &str,
        controller_id: &str,
    ) -> Result<Vec<TrustGrantRecord>, StoreError> {
        Ok(self
            .list_grants()
            .await?
            .into_iter()
            .filter(|grant| {
                (!email.is_empty() && grant.controller_email == email)
                    || grant.controller_id.as_deref() == Some(controller_id)
            })
            .collect())
    }

    async fn list_grants(&self) -> Result<Vec<TrustGrantRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.list_grants().await),
            Backend::Redis(store) => store.list_grants().await,
        }
    }

    /// Idempotent: revoking an already-inactive grant is a success.
    pub async fn deactivate_grant(&self, id: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.deactivate_grant(id).await,
            Backend::Redis(store) => store.deactivate_grant(id).await,
        }
    }

    /// Stamp `last_used_at`; binds the controller account id on first use
    /// so later lookups can match even if the email moves.
    pub async fn mark_grant_used(
        &self,
        id: &str,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.mark_grant_used(id, controller_id, now).await,
            Backend::Redis(store) => store.mark_grant_used(id, controller_id, now).await,
        }
    }

    // --- devices ---

    pub async fn put_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.put_device(record).await,
            Backend::Redis(store) => store.put_device(record).await,
        }
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.get_device(id).await),
            Backend::Redis(store) => store.get_device(id).await,
        }
    }

    pub async fn find_device_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(store) => {
                Ok(store.find_device(|d| d.fingerprint == fingerprint).await)
            }
            Backend::Redis(store) => store.find_device_by_fingerprint(fingerprint).await,
        }
    }

    pub async fn list_devices_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut devices = match &self.backend {
            Backend::Memory(store) => store.list_devices().await,
            Backend::Redis(store) => store.list_devices().await?,
        };
        devices.retain(|device| device.user_id == user_id);
        devices.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(devices)
    }

    pub async fn set_device_online(
        &self,
        id: &str,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<DeviceRecord, StoreError> {
        match &self.backend {
            Backend::Memory(store) => store.set_device_online(id, online, now).await,
            Backend::Redis(store) => store.set_device_online(id, online, now).await,
        }
    }
}

// --- in-memory backend ---

#[derive(Default)]
struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    grants: RwLock<HashMap<String, TrustGrantRecord>>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryStore {
    async fn insert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let clash = sessions.values().any(|existing| {
            existing.id == record.id
                || existing.token == record.token
                || existing.room_id == record.room_id
        });
        if clash {
            return Err(StoreError::Duplicate);
        }
        sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn find_session(&self, pred: impl Fn(&SessionRecord) -> bool) -> Option<SessionRecord> {
        self.sessions.read().await.values().find(|s| pred(s)).cloned()
    }

    async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn expire_if_due(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExpireOutcome, StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
        if record.status.is_terminal() {
            return Ok(ExpireOutcome::AlreadyTerminal);
        }
        match record.expires_at {
            Some(expires_at) if expires_at <= now => {
                record.status = SessionStatus::Expired;
                Ok(ExpireOutcome::Expired)
            }
            _ => Ok(ExpireOutcome::NotDue),
        }
    }

    async fn attach_controller(
        &self,
        id: &str,
        controller_id: &str,
        controller_device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AttachOutcome, StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
        if record.controller_id.is_some() {
            return Ok(AttachOutcome::ControllerPresent);
        }
        if record.status != SessionStatus::Pending {
            return Ok(AttachOutcome::NotJoinable);
        }
        record.controller_id = Some(controller_id.to_string());
        record.controller_device_id = Some(controller_device_id.to_string());
        record.status = SessionStatus::Active;
        record.started_at = Some(now);
        Ok(AttachOutcome::Attached(record.clone()))
    }

    async fn end_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
        if !record.status.is_terminal() {
            record.status = SessionStatus::Ended;
            record.ended_at = Some(now);
        }
        Ok(record.clone())
    }

    async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn insert_grant(&self, record: &TrustGrantRecord) -> Result<(), StoreError> {
        let mut grants = self.grants.write().await;
        let clash = grants.values().any(|existing| {
            existing.owner_id == record.owner_id
                && existing.controller_email == record.controller_email
        });
        if clash {
            return Err(StoreError::Duplicate);
        }
        grants.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_grant(&self, id: &str) -> Option<TrustGrantRecord> {
        self.grants.read().await.get(id).cloned()
    }

    async fn list_grants(&self) -> Vec<TrustGrantRecord> {
        self.grants.read().await.values().cloned().collect()
    }

    async fn deactivate_grant(&self, id: &str) -> Result<(), StoreError> {
        let mut grants = self.grants.write().await;
        let record = grants.get_mut(id).ok_or(StoreError::NotFound)?;
        record.is_active = false;
        Ok(())
    }

    async fn mark_grant_used(
        &self,
        id: &str,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut grants = self.grants.write().await;
        let record = grants.get_mut(id).ok_or(StoreError::NotFound)?;
        record.last_used_at = Some(now);
        if record.controller_id.is_none() {
            record.controller_id = Some(controller_id.to_string());
        }
        Ok(())
    }

    async fn put_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.devices
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_device(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(id).cloned()
    }

    async fn find_device(&self, pred: impl Fn(&DeviceRecord) -> bool) -> Option<DeviceRecord> {
        self.devices.read().await.values().find(|d| pred(d)).cloned()
    }

    async fn list_devices(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn set_device_online(
        &self,
        id: &str,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<DeviceRecord, StoreError> {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(id).ok_or(StoreError::NotFound)?;
        record.online = online;
        record.last_active = now;
        Ok(record.clone())
    }
}

// --- redis backend ---

const EXPIRE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local s = cjson.decode(raw)
if s.status == 'ended' or s.status == 'expired' then return 'terminal' end
if s.expires_at == cjson.null then return 'not_due' end
if tonumber(s.expires_at) > tonumber(ARGV[1]) then return 'not_due' end
s.status = 'expired'
redis.call('SET', KEYS[1], cjson.encode(s))
return 'expired'
"#;

const ATTACH_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local s = cjson.decode(raw)
if s.controller_id ~= cjson.null then return 'controller_present' end
if s.status ~= 'pending' then return 'not_joinable' end
s.controller_id = ARGV[1]
s.controller_device_id = ARGV[2]
s.status = 'active'
s.started_at = tonumber(ARGV[3])
redis.call('SET', KEYS[1], cjson.encode(s))
return 'attached'
"#;

const END_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local s = cjson.decode(raw)
if s.status == 'ended' or s.status == 'expired' then return 'terminal' end
s.status = 'ended'
s.ended_at = tonumber(ARGV[1])
redis.call('SET', KEYS[1], cjson.encode(s))
return 'ended'
"#;

const DEACTIVATE_GRANT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local g = cjson.decode(raw)
g.is_active = false
redis.call('SET', KEYS[1], cjson.encode(g))
return 'ok'
"#;

const MARK_GRANT_USED_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local g = cjson.decode(raw)
g.last_used_at = tonumber(ARGV[1])
if g.controller_id == cjson.null then g.controller_id = ARGV[2] end
redis.call('SET', KEYS[1], cjson.encode(g))
return 'ok'
"#;

struct RelayScripts {
    expire: Script,
    attach: Script,
    end_session: Script,
    deactivate_grant: Script,
    mark_grant_used: Script,
}

#[derive(Clone)]
struct RedisStore {
    conn: ConnectionManager,
    scripts: Arc<RelayScripts>,
}

impl RedisStore {
    fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Arc::new(RelayScripts {
                expire: Script::new(EXPIRE_SCRIPT),
                attach: Script::new(ATTACH_SCRIPT),
                end_session: Script::new(END_SCRIPT),
                deactivate_grant: Script::new(DEACTIVATE_GRANT_SCRIPT),
                mark_grant_used: Script::new(MARK_GRANT_USED_SCRIPT),
            }),
        }
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let token_key = token_index_key(&record.token);
        let room_key = room_index_key(&record.room_id);

        let fresh: bool = conn.set_nx(&token_key, &record.id).await?;
        if !fresh {
            return Err(StoreError::Duplicate);
        }
        let fresh: bool = conn.set_nx(&room_key, &record.id).await?;
        if !fresh {
            let _: () = conn.del(&token_key).await?;
            return Err(StoreError::Duplicate);
        }

        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(session_key(&record.id), value).await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(session_key(id)).await?;
        decode_opt(value)
    }

    async fn find_session_by_index(
        &self,
        index_key: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(index_key).await?;
        match id {
            Some(id) => self.get_session(&id).await,
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        scan_json(&mut conn, "session:*").await
    }

    async fn expire_if_due(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExpireOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .expire
            .key(session_key(id))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        match outcome.as_str() {
            "expired" => Ok(ExpireOutcome::Expired),
            "terminal" => Ok(ExpireOutcome::AlreadyTerminal),
            "not_due" => Ok(ExpireOutcome::NotDue),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn attach_controller(
        &self,
        id: &str,
        controller_id: &str,
        controller_device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AttachOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .attach
            .key(session_key(id))
            .arg(controller_id)
            .arg(controller_device_id)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        match outcome.as_str() {
            "attached" => {
                let record = self.get_session(id).await?.ok_or(StoreError::NotFound)?;
                Ok(AttachOutcome::Attached(record))
            }
            "controller_present" => Ok(AttachOutcome::ControllerPresent),
            "not_joinable" => Ok(AttachOutcome::NotJoinable),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn end_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .end_session
            .key(session_key(id))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        match outcome.as_str() {
            "ended" | "terminal" => self.get_session(id).await?.ok_or(StoreError::NotFound),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        let Some(record) = self.get_session(id).await? else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("DEL")
            .arg(session_key(id))
            .ignore()
            .cmd("DEL")
            .arg(token_index_key(&record.token))
            .ignore()
            .cmd("DEL")
            .arg(room_index_key(&record.room_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_grant(&self, record: &TrustGrantRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pair_key = grant_pair_key(&record.owner_id, &record.controller_email);
        let fresh: bool = conn.set_nx(&pair_key, &record.id).await?;
        if !fresh {
            return Err(StoreError::Duplicate);
        }
        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(grant_key(&record.id), value).await?;
        Ok(())
    }

    async fn get_grant(&self, id: &str) -> Result<Option<TrustGrantRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(grant_key(id)).await?;
        decode_opt(value)
    }

    async fn list_grants(&self) -> Result<Vec<TrustGrantRecord>, StoreError> {
        let mut conn = self.conn.clone();
        scan_json(&mut conn, "trust:*").await
    }

    async fn deactivate_grant(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .deactivate_grant
            .key(grant_key(id))
            .invoke_async(&mut conn)
            .await?;
        if outcome == "ok" {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn mark_grant_used(
        &self,
        id: &str,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .mark_grant_used
            .key(grant_key(id))
            .arg(now.timestamp_millis())
            .arg(controller_id)
            .invoke_async(&mut conn)
            .await?;
        if outcome == "ok" {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn put_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(record)?;
        redis::pipe()
            .cmd("SET")
            .arg(device_key(&record.id))
            .arg(value)
            .ignore()
            .cmd("SET")
            .arg(device_fingerprint_key(&record.fingerprint))
            .arg(&record.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(device_key(id)).await?;
        decode_opt(value)
    }

    async fn find_device_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(device_fingerprint_key(fingerprint)).await?;
        match id {
            Some(id) => self.get_device(&id).await,
            None => Ok(None),
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        scan_json(&mut conn, "device:*").await
    }

    async fn set_device_online(
        &self,
        id: &str,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<DeviceRecord, StoreError> {
        let mut record = self.get_device(id).await?.ok_or(StoreError::NotFound)?;
        record.online = online;
        record.last_active = now;
        self.put_device(&record).await?;
        Ok(record)
    }
}

fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

fn token_index_key(token: &str) -> String {
    format!("sessidx:token:{}", token)
}

fn room_index_key(room_id: &str) -> String {
    format!("sessidx:room:{}", room_id)
}

fn grant_key(id: &str) -> String {
    format!("trust:{}", id)
}

fn grant_pair_key(owner_id: &str, email: &str) -> String {
    format!("trustidx:pair:{}:{}", owner_id, email)
}

fn device_key(id: &str) -> String {
    format!("device:{}", id)
}

fn device_fingerprint_key(fingerprint: &str) -> String {
    format!("devidx:fp:{}", fingerprint)
}

fn decode_opt<T: DeserializeOwned>(value: Option<String>) -> Result<Option<T>, StoreError> {
    match value {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

async fn scan_json<T: DeserializeOwned>(
    conn: &mut ConnectionManager,
    pattern: &str,
) -> Result<Vec<T>, StoreError> {
    let mut cursor: u64 = 0;
    let mut results = Vec::new();
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .cursor_arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(100u32)
            .query_async(conn)
            .await?;
        cursor = next_cursor;
        if !keys.is_empty() {
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(keys).query_async(conn).await?;
            for value in values.into_iter().flatten() {
                if let Ok(item) = serde_json::from_str::<T>(&value) {
                    results.push(item);
                }
            }
        }
        if cursor == 0 {
            break;
        }
    }
    Ok(results)
}
