//! Backends for the access stores.
//!
//! `memory` keeps everything in-process and is only correct for a single
//! instance. `postgres` shares state across instances.

pub mod postgres;

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::info;

use crate::access::{
    audit::{AuditSink, TracingAuditSink},
    clock::Clock,
    directory::UserDirectory,
    session::AccessStores,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

impl StoreBackend {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
/// Returns an error if the database is unreachable.
pub async fn connect(dsn: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")
}

/// Everything the server needs from storage, wired for one backend.
pub struct Backends {
    pub stores: AccessStores,
    pub directory: Arc<dyn UserDirectory>,
    pub audit_sinks: Vec<Arc<dyn AuditSink>>,
}

/// Build stores for `backend`. The user directory always lives in Postgres.
///
/// # Errors
/// Returns an error if the schema cannot be applied.
pub async fn build(backend: StoreBackend, pool: PgPool, clock: Arc<dyn Clock>) -> Result<Backends> {
    postgres::apply_schema(&pool).await?;
    let directory: Arc<dyn UserDirectory> = Arc::new(postgres::PgUserDirectory::new(pool.clone()));
    let mut audit_sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];

    let stores = match backend {
        StoreBackend::Postgres => {
            audit_sinks.push(Arc::new(postgres::PgAuditSink::new(pool.clone())));
            AccessStores {
                counters: Arc::new(postgres::PgCounterStore::new(pool.clone(), clock)),
                sessions: Arc::new(postgres::PgSessionStore::new(pool.clone())),
                csrf: Arc::new(postgres::PgCsrfStore::new(pool)),
            }
        }
        StoreBackend::Memory => AccessStores::in_memory(clock),
    };
    info!(backend = %backend, "access stores ready");

    Ok(Backends {
        stores,
        directory,
        audit_sinks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses() {
        assert_eq!("postgres".parse(), Ok(StoreBackend::Postgres));
        assert_eq!("Memory".parse(), Ok(StoreBackend::Memory));
        assert!("redis".parse::<StoreBackend>().is_err());
        assert_eq!(StoreBackend::default(), StoreBackend::Postgres);
    }
}
