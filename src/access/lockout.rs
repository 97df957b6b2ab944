//! Account lockout after repeated failed logins.
//!
//! Flow Overview:
//! 1) `check` runs before the identity provider is contacted. A live lock record rejects
//!    the attempt outright.
//! 2) `record_failure` bumps the attempt counter (window anchored at the first failure of
//!    the streak). Reaching the threshold writes a lock record that lives for the lockout
//!    duration and clears the streak.
//! 3) `record_success` clears the streak.
//!
//! Both counters live in the shared `CounterStore`, so concurrent failures are serialized
//! by its atomic increment. If a lock write is interrupted after the threshold was reached,
//! the next `check` sees `count >= threshold` without a lock and creates it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::warn;

use super::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, ClientContext},
    clock::Clock,
    counter::CounterStore,
};

/// What a lockout streak is keyed by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockoutScope {
    /// Email only. An attacker rotating addresses cannot escape the lock.
    #[default]
    Identifier,
    /// Email and client IP. A victim is not locked out by someone else's failures.
    IdentifierAndIp,
}

impl FromStr for LockoutScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "email" | "identifier" => Ok(Self::Identifier),
            "email-ip" | "email_ip" | "identifier-ip" => Ok(Self::IdentifierAndIp),
            other => Err(format!("unknown lockout scope: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub threshold: u64,
    pub window: Duration,
    pub duration: Duration,
    pub scope: LockoutScope,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::minutes(15),
            duration: Duration::minutes(15),
            scope: LockoutScope::Identifier,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockoutStatus {
    Active { failures: u64 },
    Locked { until: DateTime<Utc> },
}

pub struct LockoutGuard {
    store: Arc<dyn CounterStore>,
    policy: LockoutPolicy,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl LockoutGuard {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        policy: LockoutPolicy,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            audit,
            clock,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    fn streak_key(&self, email: &str, client: &ClientContext) -> String {
        match self.policy.scope {
            LockoutScope::Identifier => format!("lockout:{email}"),
            LockoutScope::IdentifierAndIp => format!(
                "lockout:{email}|{}",
                client.ip.as_deref().unwrap_or("unknown")
            ),
        }
    }

    fn lock_key(streak_key: &str) -> String {
        format!("{streak_key}:locked")
    }

    /// Current state for `email`. Repairs a missing lock when the streak already crossed the threshold.
    ///
    /// # Errors
    /// Returns an error if the counter store fails.
    pub async fn check(&self, email: &str, client: &ClientContext) -> Result<LockoutStatus> {
        let streak_key = self.streak_key(email, client);
        let lock_key = Self::lock_key(&streak_key);

        if let Some(lock) = self.store.get(&lock_key).await? {
            self.audit_rejected(email, client, lock.expires_at);
            return Ok(LockoutStatus::Locked {
                until: lock.expires_at,
            });
        }

        let failures = self
            .store
            .get(&streak_key)
            .await?
            .map_or(0, |value| value.count);
        if failures >= self.policy.threshold {
            warn!("lockout streak at threshold without lock record; locking now");
            let until = self.lock(&streak_key, &lock_key).await?;
            self.audit_rejected(email, client, until);
            return Ok(LockoutStatus::Locked { until });
        }

        Ok(LockoutStatus::Active { failures })
    }

    /// Count one failed attempt. Returns `Locked` when this failure reached the threshold.
    ///
    /// # Errors
    /// Returns an error if the counter store fails.
    pub async fn record_failure(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> Result<LockoutStatus> {
        let streak_key = self.streak_key(email, client);
        let streak = self
            .store
            .increment_and_get(&streak_key, self.policy.window)
            .await?;

        if streak.count < self.policy.threshold {
            return Ok(LockoutStatus::Active {
                failures: streak.count,
            });
        }

        let lock_key = Self::lock_key(&streak_key);
        let until = self.lock(&streak_key, &lock_key).await?;
        self.audit.record(
            AuditEvent::new(AuditAction::Lockout, AuditOutcome::Denied)
                .client(client)
                .detail(format!(
                    "identifier={email} failures={} locked_until={}",
                    streak.count,
                    until.to_rfc3339()
                )),
        );
        Ok(LockoutStatus::Locked { until })
    }

    /// Clear the failure streak after a successful login.
    ///
    /// # Errors
    /// Returns an error if the counter store fails.
    pub async fn record_success(&self, email: &str, client: &ClientContext) -> Result<()> {
        self.store.reset(&self.streak_key(email, client)).await
    }

    async fn lock(&self, streak_key: &str, lock_key: &str) -> Result<DateTime<Utc>> {
        // Repeated increments on a live lock keep its original expiry.
        let lock = self
            .store
            .increment_and_get(lock_key, self.policy.duration)
            .await?;
        self.store.reset(streak_key).await?;
        Ok(lock.expires_at)
    }

    fn audit_rejected(&self, email: &str, client: &ClientContext, until: DateTime<Utc>) {
        let remaining = until.signed_duration_since(self.clock.now()).num_seconds();
        self.audit.record(
            AuditEvent::new(AuditAction::Lockout, AuditOutcome::Denied)
                .client(client)
                .detail(format!(
                    "identifier={email} attempt rejected, {remaining}s remaining"
                )),
        );
    }
}

impl fmt::Debug for LockoutGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockoutGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{clock::ManualClock, counter::MemoryCounterStore};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryCounterStore>,
        audit: Arc<AuditLogger>,
        guard: LockoutGuard,
    }

    fn harness(policy: LockoutPolicy) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let audit = Arc::new(AuditLogger::new(64, clock.clone()));
        let guard = LockoutGuard::new(store.clone(), policy, audit.clone(), clock.clone());
        Harness {
            clock,
            store,
            audit,
            guard,
        }
    }

    fn client(ip: &str) -> ClientContext {
        ClientContext::new(Some(ip.to_string()), None)
    }

    #[tokio::test]
    async fn fifth_failure_locks_for_duration() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");

        for expected in 1..5 {
            assert_eq!(
                h.guard.record_failure("a@example.com", &c).await?,
                LockoutStatus::Active { failures: expected }
            );
        }
        let locked = h.guard.record_failure("a@example.com", &c).await?;
        assert_eq!(
            locked,
            LockoutStatus::Locked {
                until: h.clock.now() + Duration::minutes(15)
            }
        );
        assert!(matches!(
            h.guard.check("a@example.com", &c).await?,
            LockoutStatus::Locked { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn lock_expires_back_to_active_zero() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");
        for _ in 0..5 {
            h.guard.record_failure("a@example.com", &c).await?;
        }
        h.clock.advance(Duration::minutes(15));
        assert_eq!(
            h.guard.check("a@example.com", &c).await?,
            LockoutStatus::Active { failures: 0 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn success_resets_streak() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");
        for _ in 0..4 {
            h.guard.record_failure("a@example.com", &c).await?;
        }
        h.guard.record_success("a@example.com", &c).await?;
        assert_eq!(
            h.guard.check("a@example.com", &c).await?,
            LockoutStatus::Active { failures: 0 }
        );
        assert_eq!(
            h.guard.record_failure("a@example.com", &c).await?,
            LockoutStatus::Active { failures: 1 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn failure_after_window_starts_new_streak() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");
        for _ in 0..4 {
            h.guard.record_failure("a@example.com", &c).await?;
        }
        h.clock.advance(Duration::minutes(16));
        assert_eq!(
            h.guard.record_failure("a@example.com", &c).await?,
            LockoutStatus::Active { failures: 1 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_lock_is_repaired_on_check() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");
        // Streak at threshold, lock record never written.
        for _ in 0..5 {
            h.store
                .increment_and_get("lockout:a@example.com", Duration::minutes(15))
                .await?;
        }
        let status = h.guard.check("a@example.com", &c).await?;
        assert_eq!(
            status,
            LockoutStatus::Locked {
                until: h.clock.now() + Duration::minutes(15)
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn identifier_scope_ignores_ip() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        for index in 0..5 {
            h.guard
                .record_failure("a@example.com", &client(&format!("198.51.100.{index}")))
                .await?;
        }
        assert!(matches!(
            h.guard.check("a@example.com", &client("192.0.2.1")).await?,
            LockoutStatus::Locked { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn identifier_and_ip_scope_isolates_clients() -> Result<()> {
        let h = harness(LockoutPolicy {
            scope: LockoutScope::IdentifierAndIp,
            ..LockoutPolicy::default()
        });
        for _ in 0..5 {
            h.guard
                .record_failure("a@example.com", &client("198.51.100.1"))
                .await?;
        }
        assert!(matches!(
            h.guard
                .check("a@example.com", &client("198.51.100.1"))
                .await?,
            LockoutStatus::Locked { .. }
        ));
        assert_eq!(
            h.guard.check("a@example.com", &client("192.0.2.1")).await?,
            LockoutStatus::Active { failures: 0 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn lock_and_rejection_are_audited() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let c = client("203.0.113.9");
        for _ in 0..5 {
            h.guard.record_failure("a@example.com", &c).await?;
        }
        h.guard.check("a@example.com", &c).await?;

        let events = h.audit.recent(10);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == AuditAction::Lockout));
        assert!(events.iter().all(|e| e.outcome == AuditOutcome::Denied));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_lock_exactly_once() -> Result<()> {
        let h = harness(LockoutPolicy::default());
        let guard = Arc::new(h.guard);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .record_failure("a@example.com", &ClientContext::default())
                    .await
            }));
        }
        let mut locked = 0;
        for handle in handles {
            if matches!(handle.await??, LockoutStatus::Locked { .. }) {
                locked += 1;
            }
        }
        assert_eq!(locked, 1);
        assert!(matches!(
            guard
                .check("a@example.com", &ClientContext::default())
                .await?,
            LockoutStatus::Locked { .. }
        ));
        Ok(())
    }

    #[test]
    fn scope_parses_from_config_values() {
        assert_eq!("email".parse(), Ok(LockoutScope::Identifier));
        assert_eq!("email-ip".parse(), Ok(LockoutScope::IdentifierAndIp));
        assert!("ip".parse::<LockoutScope>().is_err());
    }
}
