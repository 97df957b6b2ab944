//! Security audit trail.
//!
//! Flow Overview:
//! 1) Components build an `AuditEvent` and call `AuditLogger::record`.
//! 2) The logger stamps it, appends it to a bounded ring (oldest entry dropped when full),
//!    and publishes it on a bounded broadcast channel.
//! 3) `spawn_audit_worker` drains the channel into durable sinks. A sink that falls
//!    behind loses the oldest entries (`Lagged`) instead of slowing down callers.
//!
//! `record` never awaits and never fails.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::clock::Clock;

pub const ANONYMOUS_ACTOR: &str = "anonymous";
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    SessionValidate,
    SessionRevoke,
    CsrfVerify,
    RateLimit,
    RateLimitBypass,
    Lockout,
    PermissionCheck,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::SessionValidate => "session_validate",
            Self::SessionRevoke => "session_revoke",
            Self::CsrfVerify => "csrf_verify",
            Self::RateLimit => "rate_limit",
            Self::RateLimitBypass => "rate_limit_bypass",
            Self::Lockout => "lockout",
            Self::PermissionCheck => "permission_check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// Who is calling, as far as the transport can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    /// Resolved client address, after trusted proxies are peeled off.
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Address of the socket peer. Never taken from a header.
    pub peer: Option<String>,
}

impl ClientContext {
    #[must_use]
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip,
            user_agent,
            peer: None,
        }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Option<String>) -> Self {
        self.peer = peer;
        self
    }
}

/// An event as emitted by a component, before the logger stamps it.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    actor: Option<String>,
    action: AuditAction,
    outcome: AuditOutcome,
    client: ClientContext,
    detail: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            actor: None,
            action,
            outcome,
            client: ClientContext::default(),
            detail: None,
        }
    }

    #[must_use]
    pub fn actor(mut self, subject_id: impl Into<String>) -> Self {
        self.actor = Some(subject_id.into());
        self
    }

    #[must_use]
    pub fn client(mut self, client: &ClientContext) -> Self {
        self.client = client.clone();
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Immutable, stamped audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub detail: Option<String>,
}

pub struct AuditLogger {
    recent: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    publisher: broadcast::Sender<AuditRecord>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let (publisher, _) = broadcast::channel(capacity);
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            publisher,
            clock,
        }
    }

    pub fn record(&self, event: AuditEvent) {
        let record = AuditRecord {
            id: Uuid::now_v7(),
            timestamp: self.clock.now(),
            actor: event
                .actor
                .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string()),
            action: event.action,
            outcome: event.outcome,
            ip: event.client.ip,
            user_agent: event.client.user_agent,
            detail: event.detail,
        };

        {
            let mut recent = self.recent.lock();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }

        // No subscribers is fine; the ring still holds the entry.
        let _ = self.publisher.send(record);
    }

    /// Newest entries first, at most `limit`.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.recent
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.publisher.subscribe()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("capacity", &self.capacity)
            .field("buffered", &self.recent.lock().len())
            .finish_non_exhaustive()
    }
}

/// Durable destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<()>;
}

/// Writes audit records to the `audit` tracing target.
#[derive(Clone, Debug)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            id = %record.id,
            actor = %record.actor,
            action = record.action.as_str(),
            outcome = record.outcome.as_str(),
            ip = record.ip.as_deref().unwrap_or("-"),
            user_agent = record.user_agent.as_deref().unwrap_or("-"),
            detail = record.detail.as_deref().unwrap_or(""),
            "audit event"
        );
        Ok(())
    }
}

/// Spawn a background task that forwards published records to every sink.
pub fn spawn_audit_worker(
    mut receiver: broadcast::Receiver<AuditRecord>,
    sinks: Vec<Arc<dyn AuditSink>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(record) => {
                    for sink in &sinks {
                        if let Err(err) = sink.write(&record).await {
                            error!("audit sink write failed: {err:#}");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "audit sink fell behind; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::clock::ManualClock;
    use tokio::sync::mpsc;

    fn logger(capacity: usize) -> AuditLogger {
        AuditLogger::new(capacity, Arc::new(ManualClock::starting_now()))
    }

    #[test]
    fn record_defaults_to_anonymous_actor() {
        let logger = logger(4);
        logger.record(AuditEvent::new(AuditAction::Login, AuditOutcome::Failure));
        let recent = logger.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].actor, ANONYMOUS_ACTOR);
        assert_eq!(recent[0].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let logger = logger(3);
        for index in 0..5 {
            logger.record(
                AuditEvent::new(AuditAction::Login, AuditOutcome::Success)
                    .actor(format!("user-{index}")),
            );
        }
        let actors: Vec<String> = logger.recent(10).into_iter().map(|r| r.actor).collect();
        assert_eq!(actors, vec!["user-4", "user-3", "user-2"]);
    }

    #[test]
    fn recent_honours_limit() {
        let logger = logger(10);
        for _ in 0..6 {
            logger.record(AuditEvent::new(AuditAction::Logout, AuditOutcome::Success));
        }
        assert_eq!(logger.recent(2).len(), 2);
    }

    #[test]
    fn client_context_is_captured() {
        let logger = logger(2);
        let client = ClientContext::new(Some("203.0.113.7".into()), Some("curl/8".into()));
        logger.record(
            AuditEvent::new(AuditAction::CsrfVerify, AuditOutcome::Denied)
                .client(&client)
                .detail("mismatch"),
        );
        let record = &logger.recent(1)[0];
        assert_eq!(record.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(record.detail.as_deref(), Some("mismatch"));
    }

    struct ChannelSink(mpsc::UnboundedSender<AuditRecord>);

    #[async_trait]
    impl AuditSink for ChannelSink {
        async fn write(&self, record: &AuditRecord) -> Result<()> {
            self.0.send(record.clone())?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_forwards_records_to_sinks() -> Result<()> {
        let logger = logger(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_audit_worker(logger.subscribe(), vec![Arc::new(ChannelSink(tx))]);

        logger.record(AuditEvent::new(AuditAction::Login, AuditOutcome::Success).actor("u1"));
        let forwarded = rx.recv().await.ok_or_else(|| anyhow::anyhow!("no record"))?;
        assert_eq!(forwarded.actor, "u1");

        handle.abort();
        Ok(())
    }

    #[test]
    fn record_without_subscribers_does_not_block() {
        let logger = logger(1);
        for _ in 0..100 {
            logger.record(AuditEvent::new(AuditAction::RateLimit, AuditOutcome::Denied));
        }
        assert_eq!(logger.recent(100).len(), 1);
    }
}
