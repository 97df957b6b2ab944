//! `PostgreSQL` implementations of the access stores.
//!
//! Scaling: every instance pointed at the same database shares lockout state,
//! rate-limit counters, sessions and CSRF bindings.
//!
//! Counter increments are a single `INSERT .. ON CONFLICT DO UPDATE .. RETURNING`,
//! so the row lock serializes concurrent callers and a dropped request never leaves
//! a half-applied update.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::sync::Arc;
use tracing::{Instrument, Span, info_span};

use crate::access::{
    audit::{AuditRecord, AuditSink},
    clock::Clock,
    counter::{CounterStore, CounterValue},
    csrf::{CsrfRecord, CsrfStore},
    directory::{AdminUser, UserDirectory},
    rbac::{Permission, Role},
    session::{Session, SessionStore},
};

/// Schema for every table used by this module.
pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Apply `sql/schema.sql`. Every statement is idempotent.
///
/// # Errors
/// Returns an error if the schema cannot be applied.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .instrument(db_span("DDL", "sql/schema.sql"))
        .await
        .context("failed to apply schema")?;
    Ok(())
}

fn to_count(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative counter value: {value}"))
}

#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<CounterValue> {
        let query = r"
            INSERT INTO access_counters (key, count, window_start, expires_at)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE WHEN access_counters.expires_at > $2
                    THEN access_counters.count + 1 ELSE 1 END,
                window_start = CASE WHEN access_counters.expires_at > $2
                    THEN access_counters.window_start ELSE $2 END,
                expires_at = CASE WHEN access_counters.expires_at > $2
                    THEN access_counters.expires_at ELSE $3 END
            RETURNING count, window_start, expires_at";
        let now = self.clock.now();
        let row = sqlx::query(query)
            .bind(key)
            .bind(now)
            .bind(now + ttl)
            .fetch_one(&self.pool)
            .instrument(db_span("UPSERT", query))
            .await
            .context("failed to increment counter")?;
        Ok(CounterValue {
            count: to_count(row.try_get("count")?)?,
            window_start: row.try_get("window_start")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<CounterValue>> {
        let query = "SELECT count, window_start, expires_at FROM access_counters \
                     WHERE key = $1 AND expires_at > $2";
        let row = sqlx::query(query)
            .bind(key)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to read counter")?;
        row.map(|row| -> Result<CounterValue> {
            Ok(CounterValue {
                count: to_count(row.try_get("count")?)?,
                window_start: row.try_get("window_start")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let query = "DELETE FROM access_counters WHERE key = $1";
        sqlx::query(query)
            .bind(key)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to reset counter")?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM access_counters WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(self.clock.now())
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge counters")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let role: String = row.try_get("role")?;
    let permissions: Vec<String> = row.try_get("permissions")?;
    Ok(Session {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        email: row.try_get("email")?,
        role: role.parse::<Role>().map_err(|err| anyhow!(err))?,
        permissions: permissions
            .iter()
            .map(|permission| permission.parse::<Permission>().map_err(|err| anyhow!(err)))
            .collect::<Result<_>>()?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        expires_at: row.try_get("expires_at")?,
        remember_me: row.try_get("remember_me")?,
    })
}

fn permission_names(session: &Session) -> Vec<&'static str> {
    session
        .permissions
        .iter()
        .map(|permission| permission.as_str())
        .collect()
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        let query = r"
            INSERT INTO access_sessions
                (id, subject_id, email, role, permissions,
                 created_at, last_activity_at, expires_at, remember_me)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";
        sqlx::query(query)
            .bind(&session.id)
            .bind(&session.subject_id)
            .bind(&session.email)
            .bind(session.role.as_str())
            .bind(permission_names(session))
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(session.expires_at)
            .bind(session.remember_me)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = r"
            SELECT id, subject_id, email, role, permissions,
                   created_at, last_activity_at, expires_at, remember_me
            FROM access_sessions
            WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to read session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let query = r"
            UPDATE access_sessions
            SET role = $2, permissions = $3, last_activity_at = $4
            WHERE id = $1";
        sqlx::query(query)
            .bind(&session.id)
            .bind(session.role.as_str())
            .bind(permission_names(session))
            .bind(session.last_activity_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update session")?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let query = "DELETE FROM access_sessions WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_subject(&self, subject_id: &str) -> Result<Vec<String>> {
        let query = "DELETE FROM access_sessions WHERE subject_id = $1 RETURNING id";
        let rows = sqlx::query(query)
            .bind(subject_id)
            .fetch_all(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to revoke sessions")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(anyhow::Error::from))
            .collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>, idle_before: DateTime<Utc>) -> Result<u64> {
        let query =
            "DELETE FROM access_sessions WHERE expires_at < $1 OR last_activity_at < $2";
        let result = sqlx::query(query)
            .bind(now)
            .bind(idle_before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge sessions")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgCsrfStore {
    pool: PgPool,
}

impl PgCsrfStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CsrfStore for PgCsrfStore {
    async fn put(&self, record: CsrfRecord) -> Result<()> {
        let query = r"
            INSERT INTO access_csrf_tokens (hash, binding, issued_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash) DO UPDATE SET
                binding = EXCLUDED.binding,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at";
        sqlx::query(query)
            .bind(&record.hash)
            .bind(&record.binding)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(db_span("UPSERT", query))
            .await
            .context("failed to store csrf token")?;
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<CsrfRecord>> {
        let query =
            "SELECT hash, binding, issued_at, expires_at FROM access_csrf_tokens WHERE hash = $1";
        let row = sqlx::query(query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to read csrf token")?;
        row.map(|row| -> Result<CsrfRecord> {
            Ok(CsrfRecord {
                hash: row.try_get("hash")?,
                binding: row.try_get("binding")?,
                issued_at: row.try_get("issued_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        let query = "DELETE FROM access_csrf_tokens WHERE hash = $1";
        sqlx::query(query)
            .bind(hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to remove csrf token")?;
        Ok(())
    }

    async fn remove_binding(&self, binding: &str) -> Result<u64> {
        let query = "DELETE FROM access_csrf_tokens WHERE binding = $1";
        let result = sqlx::query(query)
            .bind(binding)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to revoke csrf tokens")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM access_csrf_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge csrf tokens")?;
        Ok(result.rows_affected())
    }
}

/// Reads admin records from `admin_users`.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get(&self, subject_id: &str) -> Result<Option<AdminUser>> {
        let query = r"
            SELECT id, email, role, active, created_at, last_login_at
            FROM admin_users
            WHERE id = $1";
        let row = sqlx::query(query)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup admin user")?;
        row.map(|row| -> Result<AdminUser> {
            let role: String = row.try_get("role")?;
            Ok(AdminUser {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                role: role.parse::<Role>().map_err(|err| anyhow!(err))?,
                active: row.try_get("active")?,
                created_at: row.try_get("created_at")?,
                last_login_at: row.try_get("last_login_at")?,
            })
        })
        .transpose()
    }

    async fn touch_last_login(&self, subject_id: &str, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE admin_users SET last_login_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(subject_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update last login")?;
        Ok(())
    }
}

/// Durable audit trail in `audit_events`.
#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let query = r"
            INSERT INTO audit_events
                (id, occurred_at, actor, action, outcome, ip, user_agent, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING";
        sqlx::query(query)
            .bind(record.id)
            .bind(record.timestamp)
            .bind(&record.actor)
            .bind(record.action.as_str())
            .bind(record.outcome.as_str())
            .bind(record.ip.as_deref())
            .bind(record.user_agent.as_deref())
            .bind(record.detail.as_deref())
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert audit event")?;
        Ok(())
    }
}
