//! Trust ledger: standing authorizations letting a named controller
//! identity start a permanent session against a specific owner device.
//!
//! Grants are unique per (owner, controller email). Revocation flips
//! `is_active` and never deletes, so the history stays auditable.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use skylight_proto::GrantPermissions;

use crate::auth::Identity;
use crate::store::{DeviceRecord, Store, StoreError, TrustGrantRecord};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// One entry of the controller-side "what can I reach" view: an active
/// grant joined with its owner device, filtered to online devices.
#[derive(Debug, Clone)]
pub struct AvailableDevice {
    pub grant_id: String,
    pub device: DeviceRecord,
    pub owner_id: String,
    pub permissions: GrantPermissions,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TrustLedger {
    store: Store,
}

impl TrustLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record a standing authorization for `controller_email` against one
    /// of the caller's devices. The pair is unique across active and
    /// revoked grants alike; re-granting a revoked pair is a `Conflict`,
    /// not a fresh insert.
    pub async fn grant(
        &self,
        identity: &Identity,
        owner_device_id: &str,
        controller_email: &str,
        permissions: GrantPermissions,
    ) -> Result<TrustGrantRecord, TrustError> {
        let device = self.owned_device(identity, owner_device_id).await?;
        let email = normalize_email(controller_email);

        let record = TrustGrantRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: identity.user_id.clone(),
            owner_device_id: device.id,
            controller_email: email,
            controller_id: None,
            permissions,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };

        match self.store.insert_grant(&record).await {
            Ok(()) => {
                info!(
                    grant = %record.id,
                    owner = %record.owner_id,
                    "trust grant added"
                );
                Ok(record)
            }
            Err(StoreError::Duplicate) => Err(TrustError::Conflict("email already trusted")),
            Err(err) => Err(err.into()),
        }
    }

    /// The caller's active grants.
    pub async fn list(&self, identity: &Identity) -> Result<Vec<TrustGrantRecord>, TrustError> {
        let mut grants = self.store.list_grants_by_owner(&identity.user_id).await?;
        grants.retain(|grant| grant.is_active);
        grants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(grants)
    }

    /// Soft-revoke a grant the caller owns. A grant that does not exist,
    /// or belongs to someone else, is reported as absent. Revoking twice
    /// succeeds quietly.
    pub async fn revoke(&self, identity: &Identity, grant_id: &str) -> Result<(), TrustError> {
        let grant = self
            .store
            .get_grant(grant_id)
            .await?
            .ok_or(TrustError::NotFound("grant"))?;
        if grant.owner_id != identity.user_id {
            return Err(TrustError::NotFound("grant"));
        }

        match self.store.deactivate_grant(grant_id).await {
            Ok(()) => {
                info!(grant = %grant_id, "trust grant revoked");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Owner devices the calling controller may connect to right now:
    /// active grants addressed to it, restricted to online devices.
    pub async fn resolve_available(
        &self,
        identity: &Identity,
    ) -> Result<Vec<AvailableDevice>, TrustError> {
        let grants = self
            .store
            .list_grants_for_controller(&identity.email, &identity.user_id)
            .await?;

        let mut entries = Vec::new();
        for grant in grants.into_iter().filter(|grant| grant.is_active) {
            let Some(device) = self.store.get_device(&grant.owner_device_id).await? else {
                continue;
            };
            if !device.online {
                continue;
            }
            entries.push(AvailableDevice {
                grant_id: grant.id,
                device,
                owner_id: grant.owner_id,
                permissions: grant.permissions,
                last_used_at: grant.last_used_at,
            });
        }
        entries.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(entries)
    }

    async fn owned_device(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<DeviceRecord, TrustError> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or(TrustError::NotFound("device"))?;
        if device.user_id != identity.user_id {
            return Err(TrustError::NotFound("device"));
        }
        Ok(device)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: &str, email: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            email: email.to_string(),
        }
    }

    async fn seed_device(store: &Store, id: &str, user_id: &str, online: bool) {
        store
            .put_device(&DeviceRecord {
                id: id.to_string(),
                user_id: user_id.to_string(),
                fingerprint: format!("fp-{id}"),
                name: format!("Device {id}"),
                user_agent: "test-agent".to_string(),
                online,
                last_active: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn ledger() -> (TrustLedger, Store) {
        let store = Store::memory();
        (TrustLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn duplicate_grant_conflicts_even_after_revoke() {
        let (ledger, store) = ledger();
        let owner = identity("owner-1", "o@e.com");
        seed_device(&store, "dev-o", "owner-1", true).await;

        let grant = ledger
            .grant(&owner, "dev-o", "X@Y.com", GrantPermissions::default())
            .await
            .unwrap();
        assert_eq!(grant.controller_email, "x@y.com");

        // same pair, different casing
        let err = ledger
            .grant(&owner, "dev-o", "x@y.COM ", GrantPermissions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::Conflict(_)));

        // revocation keeps the record, so the pair stays taken
        ledger.revoke(&owner, &grant.id).await.unwrap();
        let err = ledger
            .grant(&owner, "dev-o", "x@y.com", GrantPermissions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::Conflict(_)));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_scoped_to_owner() {
        let (ledger, store) = ledger();
        let owner = identity("owner-1", "o@e.com");
        seed_device(&store, "dev-o", "owner-1", true).await;

        let grant = ledger
            .grant(&owner, "dev-o", "c@e.com", GrantPermissions::default())
            .await
            .unwrap();

        let err = ledger
            .revoke(&identity("intruder", "i@e.com"), &grant.id)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::NotFound(_)));

        ledger.revoke(&owner, &grant.id).await.unwrap();
        ledger.revoke(&owner, &grant.id).await.unwrap();
        let record = store.get_grant(&grant.id).await.unwrap().unwrap();
        assert!(!record.is_active);
    }

    #[tokio::test]
    async fn grant_requires_callers_device() {
        let (ledger, store) = ledger();
        seed_device(&store, "dev-x", "someone-else", true).await;

        let err = ledger
            .grant(
                &identity("owner-1", "o@e.com"),
                "dev-x",
                "c@e.com",
                GrantPermissions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::NotFound("device")));
    }

    #[tokio::test]
    async fn available_devices_filter_offline_and_revoked() {
        let (ledger, store) = ledger();
        let owner = identity("owner-1", "o@e.com");
        seed_device(&store, "dev-online", "owner-1", true).await;
        seed_device(&store, "dev-offline", "owner-1", false).await;

        let kept = ledger
            .grant(&owner, "dev-online", "ctrl@e.com", GrantPermissions::default())
            .await
            .unwrap();
        ledger
            .grant(&owner, "dev-offline", "ctrl2@e.com", GrantPermissions::default())
            .await
            .unwrap();
        let revoked = ledger
            .grant(
                &identity("owner-1", "o@e.com"),
                "dev-online",
                "other@e.com",
                GrantPermissions::default(),
            )
            .await
            .unwrap();
        ledger.revoke(&owner, &revoked.id).await.unwrap();

        let controller = identity("ctrl-1", "ctrl@e.com");
        let available = ledger.resolve_available(&controller).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].grant_id, kept.id);
        assert_eq!(available[0].device.id, "dev-online");

        // offline grant addressed to a different controller anyway; the
        // offline filter is what hides ctrl2's device from ctrl2
        let ctrl2 = identity("ctrl-2", "ctrl2@e.com");
        assert!(ledger.resolve_available(&ctrl2).await.unwrap().is_empty());

        let other = identity("ctrl-3", "other@e.com");
        assert!(ledger.resolve_available(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_only_active_grants() {
        let (ledger, store) = ledger();
        let owner = identity("owner-1", "o@e.com");
        seed_device(&store, "dev-o", "owner-1", true).await;

        let keep = ledger
            .grant(&owner, "dev-o", "a@e.com", GrantPermissions::default())
            .await
            .unwrap();
        let drop = ledger
            .grant(&owner, "dev-o", "b@e.com", GrantPermissions::default())
            .await
            .unwrap();
        ledger.revoke(&owner, &drop.id).await.unwrap();

        let grants = ledger.list(&owner).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].id, keep.id);
    }
}
