use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    access::{
        AccessConfig, AuditLogger, Clock, HttpIdentityProvider, SessionManager, SystemClock,
        audit::spawn_audit_worker, reclaim::spawn_reclaimer,
    },
    api::{self, DatabaseHandle, TrustedProxies},
    cli::telemetry,
    storage::{self, StoreBackend},
};

const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub backend: StoreBackend,
    pub reclaim_interval_seconds: u64,
    pub identity_url: String,
    pub identity_timeout_seconds: u64,
    pub frontend_base_url: String,
    pub audit_capacity: usize,
    pub trusted_proxies: TrustedProxies,
    pub access: AccessConfig,
}

fn log_startup_args(args: &Args) {
    info!(
        port = args.port,
        backend = %args.backend,
        identity_url = %args.identity_url,
        frontend_base_url = %args.frontend_base_url,
        "starting vestibule"
    );
    debug!(trusted_proxies = ?args.trusted_proxies, "access config: {:?}", args.access);
}

/// Execute the server action.
/// # Errors
/// Returns an error if storage, the identity provider client or the listener cannot be set up.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let frontend_origin = api::frontend_origin(&args.frontend_base_url)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = storage::connect(&args.dsn).await?;
    let backends = storage::build(args.backend, pool.clone(), clock.clone())
        .await
        .context("Failed to prepare access stores")?;

    let identity = Arc::new(HttpIdentityProvider::new(
        &args.identity_url,
        Duration::from_secs(args.identity_timeout_seconds),
    )?);

    let audit = Arc::new(AuditLogger::new(args.audit_capacity, clock.clone()));
    let audit_worker = spawn_audit_worker(audit.subscribe(), backends.audit_sinks);

    let reclaimer = (args.reclaim_interval_seconds > 0).then(|| {
        spawn_reclaimer(
            backends.stores.clone(),
            clock.clone(),
            args.access.inactivity_timeout(),
            Duration::from_secs(args.reclaim_interval_seconds),
        )
    });

    let manager = Arc::new(SessionManager::new(
        args.access,
        backends.stores,
        identity,
        backends.directory,
        audit,
        clock,
    ));

    let app = api::router(
        manager,
        DatabaseHandle(Some(pool)),
        args.trusted_proxies,
        frontend_origin,
    );
    let served = api::serve(args.port, app, api::shutdown_signal()).await;

    if let Some(reclaimer) = reclaimer {
        reclaimer.abort();
    }
    // The router owned the last audit publisher; the worker exits once drained.
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit_worker)
        .await
        .is_err()
    {
        warn!("audit worker did not drain before shutdown");
    }
    telemetry::shutdown_tracer();

    served
}
