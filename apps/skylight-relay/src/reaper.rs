//! Background sweep over the session store.
//!
//! Expiry is an explicit state transition, not a store feature: the sweep
//! applies the same compare-and-set that `is_valid` applies lazily, so a
//! session whose deadline passes flips to `expired` exactly once whether a
//! join attempt or the reaper gets there first. Terminal records linger
//! for a configured grace window (expired ones stay readable briefly for
//! UI/audit correlation, ended ones per the retention setting) and are
//! then physically deleted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use skylight_proto::SessionStatus;

use crate::config::Config;
use crate::store::{ExpireOutcome, Store, StoreError};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub removed: usize,
}

pub fn spawn(store: Store, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(config.reap_interval_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match sweep(
                &store,
                config.expired_grace_seconds,
                config.ended_retention_seconds,
                Utc::now(),
            )
            .await
            {
                Ok(stats) if stats.expired > 0 || stats.removed > 0 => {
                    info!(
                        expired = stats.expired,
                        removed = stats.removed,
                        "reaper sweep"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "reaper sweep failed"),
            }
        }
    })
}

pub async fn sweep(
    store: &Store,
    expired_grace_seconds: u64,
    ended_retention_seconds: u64,
    now: DateTime<Utc>,
) -> Result<SweepStats, StoreError> {
    let mut stats = SweepStats::default();

    for record in store.list_sessions().await? {
        if !record.status.is_terminal() {
            let overdue = record
                .expires_at
                .map(|expires_at| expires_at <= now)
                .unwrap_or(false);
            if overdue {
                match store.expire_if_due(&record.id, now).await {
                    Ok(ExpireOutcome::Expired) => stats.expired += 1,
                    Ok(_) => {}
                    // deleted or transitioned under us; nothing to do
                    Err(StoreError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            // deletion is decided on a later sweep, once the grace window
            // has elapsed from the terminal timestamp
            continue;
        }

        let deadline = match record.status {
            SessionStatus::Expired => record
                .expires_at
                .map(|at| at + Duration::seconds(expired_grace_seconds as i64)),
            SessionStatus::Ended => record
                .ended_at
                .map(|at| at + Duration::seconds(ended_retention_seconds as i64)),
            _ => None,
        };
        if let Some(deadline) = deadline {
            if deadline <= now {
                store.remove_session(&record.id).await?;
                stats.removed += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionRecord;
    use skylight_proto::{Permissions, SessionKind};

    fn record(id: &str, status: SessionStatus, expires_at: Option<DateTime<Utc>>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            token: format!("inst_{id}"),
            kind: SessionKind::Instant,
            owner_id: "owner-1".to_string(),
            owner_device_id: "dev-1".to_string(),
            controller_id: None,
            controller_device_id: None,
            permissions: Permissions::default(),
            status,
            room_id: format!("room_{id}"),
            created_at: Utc::now(),
            expires_at,
            started_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn sweep_expires_overdue_sessions_once() {
        let store = Store::memory();
        let now = Utc::now();
        store
            .insert_session(&record(
                "overdue",
                SessionStatus::Pending,
                Some(now - Duration::seconds(10)),
            ))
            .await
            .unwrap();
        store
            .insert_session(&record(
                "fresh",
                SessionStatus::Pending,
                Some(now + Duration::seconds(600)),
            ))
            .await
            .unwrap();
        store
            .insert_session(&record("permanent", SessionStatus::Active, None))
            .await
            .unwrap();

        let stats = sweep(&store, 300, 3_600, now).await.unwrap();
        assert_eq!(stats, SweepStats { expired: 1, removed: 0 });

        let overdue = store.get_session("overdue").await.unwrap().unwrap();
        assert_eq!(overdue.status, SessionStatus::Expired);
        let fresh = store.get_session("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, SessionStatus::Pending);
        let permanent = store.get_session("permanent").await.unwrap().unwrap();
        assert_eq!(permanent.status, SessionStatus::Active);

        // a second sweep finds nothing new to expire
        let stats = sweep(&store, 300, 3_600, now).await.unwrap();
        assert_eq!(stats, SweepStats { expired: 0, removed: 0 });
    }

    #[tokio::test]
    async fn expired_records_stay_readable_through_the_grace_window() {
        let store = Store::memory();
        let now = Utc::now();
        store
            .insert_session(&record(
                "s1",
                SessionStatus::Pending,
                Some(now - Duration::seconds(10)),
            ))
            .await
            .unwrap();

        sweep(&store, 300, 3_600, now).await.unwrap();
        assert!(store.get_session("s1").await.unwrap().is_some());

        // inside the grace window: still readable
        let stats = sweep(&store, 300, 3_600, now + Duration::seconds(200))
            .await
            .unwrap();
        assert_eq!(stats.removed, 0);
        assert!(store.get_session("s1").await.unwrap().is_some());

        // past it: physically deleted
        let stats = sweep(&store, 300, 3_600, now + Duration::seconds(400))
            .await
            .unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.get_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ended_records_use_the_retention_window() {
        let store = Store::memory();
        let now = Utc::now();
        store
            .insert_session(&record("s1", SessionStatus::Pending, None))
            .await
            .unwrap();
        store.end_session("s1", now).await.unwrap();

        let stats = sweep(&store, 300, 3_600, now + Duration::seconds(1_000))
            .await
            .unwrap();
        assert_eq!(stats.removed, 0);

        let stats = sweep(&store, 300, 3_600, now + Duration::seconds(4_000))
            .await
            .unwrap();
        assert_eq!(stats.removed, 1);
    }
}
