//! Periodic removal of expired counters, sessions and CSRF records.
//!
//! Expiry is always evaluated lazily on read; this task only bounds storage growth.

use anyhow::Result;
use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{clock::Clock, session::AccessStores};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub counters: u64,
    pub sessions: u64,
    pub csrf_tokens: u64,
}

/// One purge pass over every store.
///
/// # Errors
/// Returns the first store error encountered.
pub async fn reclaim_once(
    stores: &AccessStores,
    clock: &dyn Clock,
    inactivity_timeout: Duration,
) -> Result<ReclaimReport> {
    let now = clock.now();
    Ok(ReclaimReport {
        counters: stores.counters.purge_expired().await?,
        sessions: stores
            .sessions
            .purge_expired(now, now - inactivity_timeout)
            .await?,
        csrf_tokens: stores.csrf.purge_expired(now).await?,
    })
}

/// Run `reclaim_once` every `interval` until the task is aborted.
pub fn spawn_reclaimer(
    stores: AccessStores,
    clock: Arc<dyn Clock>,
    inactivity_timeout: Duration,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match reclaim_once(&stores, clock.as_ref(), inactivity_timeout).await {
                Ok(report) => debug!(
                    counters = report.counters,
                    sessions = report.sessions,
                    csrf_tokens = report.csrf_tokens,
                    "reclaimed expired access records"
                ),
                Err(err) => error!("reclaim pass failed: {err:#}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{
        clock::ManualClock,
        csrf::CsrfRecord,
        rbac::Role,
        session::Session,
    };

    #[tokio::test]
    async fn reclaim_once_purges_every_store() -> Result<()> {
        let clock = Arc::new(ManualClock::starting_now());
        let stores = AccessStores::in_memory(clock.clone());
        let now = clock.now();

        stores
            .counters
            .increment_and_get("rl:login:1", Duration::seconds(10))
            .await?;
        stores
            .sessions
            .insert(&Session {
                id: "s".to_string(),
                subject_id: "u".to_string(),
                email: "u@example.com".to_string(),
                role: Role::Admin,
                permissions: Vec::new(),
                created_at: now,
                last_activity_at: now,
                expires_at: now + Duration::hours(24),
                remember_me: false,
            })
            .await?;
        stores
            .csrf
            .put(CsrfRecord {
                hash: "h".to_string(),
                binding: "anonymous".to_string(),
                issued_at: now,
                expires_at: now + Duration::hours(24),
            })
            .await?;

        clock.advance(Duration::hours(2));
        let partial = reclaim_once(&stores, clock.as_ref(), Duration::hours(1)).await?;
        assert_eq!(
            partial,
            ReclaimReport {
                counters: 1,
                sessions: 1,
                csrf_tokens: 0,
            }
        );

        clock.advance(Duration::hours(23));
        let rest = reclaim_once(&stores, clock.as_ref(), Duration::hours(1)).await?;
        assert_eq!(rest.csrf_tokens, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reclaimer_runs_on_interval() -> Result<()> {
        let clock = Arc::new(ManualClock::starting_now());
        let stores = AccessStores::in_memory(clock.clone());
        stores
            .counters
            .increment_and_get("k", Duration::seconds(1))
            .await?;
        clock.advance(Duration::seconds(5));

        let handle = spawn_reclaimer(
            stores.clone(),
            clock.clone(),
            Duration::hours(24),
            std::time::Duration::from_millis(20),
        );
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        // Already removed by the background pass.
        assert_eq!(stores.counters.purge_expired().await?, 0);
        handle.abort();
        Ok(())
    }
}
