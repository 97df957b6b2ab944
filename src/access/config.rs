use anyhow::{Result, bail};
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use super::{lockout::LockoutPolicy, rate_limit::RateLimitTable};

pub const MIN_SECRET_BYTES: usize = 32;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 86_400;
const DEFAULT_REMEMBER_ME_TTL_SECONDS: i64 = 604_800;
const DEFAULT_INACTIVITY_TIMEOUT_SECONDS: i64 = 86_400;

/// Runtime settings for the access core.
#[derive(Clone)]
pub struct AccessConfig {
    session_secret: SecretString,
    csrf_secret: SecretString,
    session_ttl: Duration,
    remember_me_ttl: Duration,
    inactivity_timeout: Duration,
    lockout: LockoutPolicy,
    rate_limits: RateLimitTable,
    rate_limit_bypass: Vec<String>,
    refresh_on_validate: bool,
    secure_cookies: bool,
}

impl AccessConfig {
    #[must_use]
    pub fn new(session_secret: SecretString, csrf_secret: SecretString) -> Self {
        Self {
            session_secret,
            csrf_secret,
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECONDS),
            remember_me_ttl: Duration::seconds(DEFAULT_REMEMBER_ME_TTL_SECONDS),
            inactivity_timeout: Duration::seconds(DEFAULT_INACTIVITY_TIMEOUT_SECONDS),
            lockout: LockoutPolicy::default(),
            rate_limits: RateLimitTable::default(),
            rate_limit_bypass: Vec::new(),
            refresh_on_validate: true,
            secure_cookies: true,
        }
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_remember_me_ttl(mut self, ttl: Duration) -> Self {
        self.remember_me_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutPolicy) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, table: RateLimitTable) -> Self {
        self.rate_limits = table;
        self
    }

    #[must_use]
    pub fn with_rate_limit_bypass(mut self, identifiers: Vec<String>) -> Self {
        self.rate_limit_bypass = identifiers;
        self
    }

    /// Re-read the directory on every validation so role changes and deactivation apply immediately.
    #[must_use]
    pub fn with_refresh_on_validate(mut self, refresh: bool) -> Self {
        self.refresh_on_validate = refresh;
        self
    }

    /// Mark cookies `Secure`. Only disable for plain-HTTP local development.
    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    /// # Errors
    /// Returns an error when a secret is too short or a duration is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.session_secret.expose_secret().len() < MIN_SECRET_BYTES {
            bail!("session secret must be at least {MIN_SECRET_BYTES} bytes");
        }
        if self.csrf_secret.expose_secret().len() < MIN_SECRET_BYTES {
            bail!("CSRF secret must be at least {MIN_SECRET_BYTES} bytes");
        }
        if self.session_secret.expose_secret() == self.csrf_secret.expose_secret() {
            bail!("session and CSRF secrets must differ");
        }
        for (name, value) in [
            ("session TTL", self.session_ttl),
            ("remember-me TTL", self.remember_me_ttl),
            ("inactivity timeout", self.inactivity_timeout),
            ("lockout window", self.lockout.window),
            ("lockout duration", self.lockout.duration),
        ] {
            if value <= Duration::zero() {
                bail!("{name} must be positive");
            }
        }
        if self.lockout.threshold == 0 {
            bail!("lockout threshold must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn session_secret(&self) -> &SecretString {
        &self.session_secret
    }

    #[must_use]
    pub fn csrf_secret(&self) -> &SecretString {
        &self.csrf_secret
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn remember_me_ttl(&self) -> Duration {
        self.remember_me_ttl
    }

    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    #[must_use]
    pub fn lockout(&self) -> LockoutPolicy {
        self.lockout
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimitTable {
        self.rate_limits
    }

    #[must_use]
    pub fn rate_limit_bypass(&self) -> &[String] {
        &self.rate_limit_bypass
    }

    #[must_use]
    pub fn refresh_on_validate(&self) -> bool {
        self.refresh_on_validate
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }
}

impl fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessConfig")
            .field("session_secret", &"[redacted]")
            .field("csrf_secret", &"[redacted]")
            .field("session_ttl", &self.session_ttl)
            .field("remember_me_ttl", &self.remember_me_ttl)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("lockout", &self.lockout)
            .field("rate_limits", &self.rate_limits)
            .field("rate_limit_bypass", &self.rate_limit_bypass)
            .field("refresh_on_validate", &self.refresh_on_validate)
            .field("secure_cookies", &self.secure_cookies)
            .finish()
    }
}
