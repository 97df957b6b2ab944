//! Maps validated CLI matches to an action.

use anyhow::{Context, Result};
use chrono::Duration;

use crate::{
    access::AccessConfig,
    cli::{
        actions::{Action, server::Args},
        commands::{limits, security, storage},
    },
};

/// Build the access configuration from parsed options and validate it.
///
/// # Errors
/// Returns an error if the secrets or durations are unusable.
pub fn access_config(security: security::Options, limits: &limits::Options) -> Result<AccessConfig> {
    let secure_cookies = security.secure_cookies();
    let config = AccessConfig::new(security.session_secret, security.csrf_secret)
        .with_session_ttl(Duration::seconds(security.session_ttl_seconds))
        .with_remember_me_ttl(Duration::seconds(security.remember_me_ttl_seconds))
        .with_inactivity_timeout(Duration::seconds(security.inactivity_timeout_seconds))
        .with_lockout(limits.lockout)
        .with_rate_limits(limits.rate_limits)
        .with_rate_limit_bypass(limits.rate_limit_bypass.clone())
        .with_secure_cookies(secure_cookies);
    config.validate().context("invalid access configuration")?;
    Ok(config)
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let storage = storage::Options::parse(matches)?;
    let security = security::Options::parse(matches)?;
    let limits = limits::Options::parse(matches)?;

    crate::api::frontend_origin(&security.frontend_base_url)
        .context("invalid --frontend-base-url")?;

    let identity_url = security.identity_url.clone();
    let identity_timeout_seconds = security.identity_timeout_seconds;
    let frontend_base_url = security.frontend_base_url.clone();
    let access = access_config(security, &limits)?;

    Ok(Action::Server(Args {
        port,
        dsn: storage.dsn,
        backend: storage.backend,
        reclaim_interval_seconds: storage.reclaim_interval_seconds,
        identity_url,
        identity_timeout_seconds,
        frontend_base_url,
        audit_capacity: limits.audit_capacity,
        trusted_proxies: limits.trusted_proxies,
        access,
    }))
}
