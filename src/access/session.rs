//! Session lifecycle and the request gate every admin call passes through.
//!
//! Flow Overview (login):
//! 1) CSRF: the pre-login token must be bound to the anonymous context.
//! 2) Rate limit: route class `login`, keyed by client IP.
//! 3) Email format, then the lockout guard. A locked identifier never reaches the IdP.
//! 4) Identity provider. A rejection counts towards lockout and returns the generic
//!    invalid-credentials error, whatever the cause.
//! 5) Directory lookup. Unknown or inactive admins get the same generic error.
//! 6) Session issued (24h, or 7d with remember-me), CSRF rotated to the new session.
//!
//! Session tokens are random; the store only ever sees `HMAC(session_secret, token)`,
//! which doubles as the session id. Login is never retried. Read-only validation
//! retries a failed store read once.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, ClientContext},
    clock::{Clock, millis_until},
    config::AccessConfig,
    counter::CounterStore,
    csrf::{CsrfBinding, CsrfPresented, CsrfProtector, CsrfStore, IssuedCsrf},
    directory::{AdminUser, IdentityProvider, UserDirectory},
    error::{AccessError, AccessResult, AuthFailure},
    lockout::{LockoutGuard, LockoutStatus},
    rate_limit::{CounterRateLimiter, RateLimitDecision, RateLimiter, RouteClass},
    rbac::{Permission, Role, has_permission, role_permissions},
    utils::{generate_token, hash_session_token, normalize_email, valid_email},
};

const UNKNOWN_CLIENT: &str = "unknown";

/// Authoritative server-side session. `id` is the keyed hash of the client token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub subject_id: String,
    pub email: String,
    pub role: Role,
    /// Snapshot taken at login, for display only. Checks use `role`.
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
}

impl Session {
    /// Absent-from-store aside, the three validity conditions.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, inactivity_timeout: Duration) -> bool {
        now <= self.expires_at && now - self.last_activity_at <= inactivity_timeout
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + fmt::Debug {
    async fn insert(&self, session: &Session) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Overwrite a stored session. No-op when it was deleted concurrently.
    async fn update(&self, session: &Session) -> Result<()>;

    /// Returns whether a session was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove every session of a subject, returning the removed ids.
    async fn delete_by_subject(&self, subject_id: &str) -> Result<Vec<String>>;

    /// Remove sessions past `expires_at` or idle since before `idle_before`.
    async fn purge_expired(&self, now: DateTime<Utc>, idle_before: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, session: &Session) -> Result<()> {
        if let Some(mut stored) = self.sessions.get_mut(&session.id) {
            *stored = session.clone();
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn delete_by_subject(&self, subject_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.subject_id == subject_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.sessions.remove(&id).is_some() {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, idle_before: DateTime<Utc>) -> Result<u64> {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            session.expires_at >= now && session.last_activity_at >= idle_before
        });
        Ok(u64::try_from(before.saturating_sub(self.sessions.len())).unwrap_or(0))
    }
}

/// Credentials as submitted to `login`.
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
    pub remember_me: bool,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// Result of a successful login. `session_token` is only ever handed to the client.
pub struct LoginOutcome {
    pub session_token: String,
    pub session: Session,
    pub user: AdminUser,
    pub csrf: IssuedCsrf,
}

impl fmt::Debug for LoginOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginOutcome")
            .field("session_token", &"[redacted]")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct RevokeOutcome {
    pub revoked: u64,
    /// Fresh CSRF token for the caller, unless the caller revoked its own session.
    pub csrf: Option<IssuedCsrf>,
}

/// Storage backends the access core writes to.
#[derive(Clone, Debug)]
pub struct AccessStores {
    pub counters: Arc<dyn CounterStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub csrf: Arc<dyn CsrfStore>,
}

impl AccessStores {
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(super::counter::MemoryCounterStore::new(clock)),
            sessions: Arc::new(MemorySessionStore::new()),
            csrf: Arc::new(super::csrf::MemoryCsrfStore::new()),
        }
    }
}

pub struct SessionManager {
    config: AccessConfig,
    sessions: Arc<dyn SessionStore>,
    csrf: CsrfProtector,
    rate_limiter: Arc<dyn RateLimiter>,
    lockout: LockoutGuard,
    identity: Arc<dyn IdentityProvider>,
    directory: Arc<dyn UserDirectory>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: AccessConfig,
        stores: AccessStores,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserDirectory>,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate_limiter = CounterRateLimiter::new(
            stores.counters.clone(),
            config.rate_limits(),
            audit.clone(),
            clock.clone(),
        )
        .with_bypass(config.rate_limit_bypass().iter().cloned());
        let lockout = LockoutGuard::new(
            stores.counters,
            config.lockout(),
            audit.clone(),
            clock.clone(),
        );
        let csrf = CsrfProtector::new(
            stores.csrf,
            config.csrf_secret().clone(),
            audit.clone(),
            clock.clone(),
        );
        Self {
            config,
            sessions: stores.sessions,
            csrf,
            rate_limiter: Arc::new(rate_limiter),
            lockout,
            identity,
            directory,
            audit,
            clock,
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.rate_limiter
    }

    fn session_id(&self, token: &str) -> String {
        hash_session_token(self.config.session_secret().expose_secret().as_bytes(), token)
    }

    /// Apply the rate limit for `route` to `identifier`.
    ///
    /// # Errors
    /// `RateLimited` when denied, `Internal` when the counter store fails.
    pub async fn enforce_rate_limit(
        &self,
        identifier: &str,
        route: RouteClass,
        client: &ClientContext,
    ) -> AccessResult<u64> {
        match self.rate_limiter.check(identifier, route, client).await? {
            RateLimitDecision::Allowed { remaining } => Ok(remaining),
            RateLimitDecision::Denied { retry_after_ms } => {
                Err(AccessError::RateLimited { retry_after_ms })
            }
        }
    }

    /// # Errors
    /// Any `AccessError`; credential problems are always the generic `InvalidCredentials`.
    pub async fn login(
        &self,
        request: LoginRequest,
        csrf: &CsrfPresented,
        client: &ClientContext,
    ) -> AccessResult<LoginOutcome> {
        let pre_login = self.csrf.verify(csrf, &CsrfBinding::Anonymous, client).await?;

        let limiter_key = client.ip.as_deref().unwrap_or(UNKNOWN_CLIENT);
        self.enforce_rate_limit(limiter_key, RouteClass::Login, client)
            .await?;

        let email = normalize_email(&request.email);
        if !valid_email(&email) {
            self.audit_login_failure(None, client, "validation");
            return Err(AccessError::Validation("A valid email address is required."));
        }
        if request.password.expose_secret().is_empty() {
            self.audit_login_failure(None, client, "validation");
            return Err(AccessError::Validation("Password is required."));
        }

        if let LockoutStatus::Locked { until } = self.lockout.check(&email, client).await? {
            return Err(AccessError::Locked {
                locked_until: until,
                retry_after_ms: millis_until(self.clock.now(), until),
            });
        }

        let assertion = match self
            .identity
            .verify_credentials(&email, &request.password)
            .await
        {
            Ok(Some(assertion)) => assertion,
            Ok(None) => {
                self.lockout.record_failure(&email, client).await?;
                self.audit_login_failure(None, client, "invalid credentials");
                return Err(AccessError::invalid_credentials());
            }
            Err(err) => {
                self.audit_login_failure(None, client, "identity provider unavailable");
                return Err(AccessError::Internal(err.context("identity provider failed")));
            }
        };

        self.lockout.record_success(&email, client).await?;

        let user = match self.directory.get(&assertion.subject_id).await? {
            Some(user) if user.active => user,
            Some(_) => {
                self.audit_login_failure(Some(&assertion.subject_id), client, "account inactive");
                return Err(AccessError::invalid_credentials());
            }
            None => {
                self.audit_login_failure(
                    Some(&assertion.subject_id),
                    client,
                    "no admin record for subject",
                );
                return Err(AccessError::invalid_credentials());
            }
        };

        let now = self.clock.now();
        self.directory.touch_last_login(&user.id, now).await?;

        let session_token = generate_token()?;
        let ttl = if request.remember_me {
            self.config.remember_me_ttl()
        } else {
            self.config.session_ttl()
        };
        let session = Session {
            id: self.session_id(&session_token),
            subject_id: user.id.clone(),
            email: user.email.clone(),
            role: user.role,
            permissions: role_permissions(user.role).to_vec(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
            remember_me: request.remember_me,
        };
        self.sessions.insert(&session).await?;

        let csrf = self
            .csrf
            .rotate(
                Some(&pre_login.hash),
                &CsrfBinding::Session(session.id.clone()),
            )
            .await?;

        self.audit.record(
            AuditEvent::new(AuditAction::Login, AuditOutcome::Success)
                .actor(&user.id)
                .client(client)
                .detail(format!("role={} remember_me={}", user.role, request.remember_me)),
        );

        Ok(LoginOutcome {
            session_token,
            session,
            user,
            csrf,
        })
    }

    fn audit_login_failure(&self, subject: Option<&str>, client: &ClientContext, detail: &str) {
        let mut event =
            AuditEvent::new(AuditAction::Login, AuditOutcome::Failure).client(client).detail(detail);
        if let Some(subject) = subject {
            event = event.actor(subject);
        }
        self.audit.record(event);
    }

    /// Destroy a session and its CSRF tokens. Idempotent.
    ///
    /// When `token` names a live session, the CSRF token bound to it is required.
    ///
    /// # Errors
    /// `Csrf` when a live session is presented without its token, `Internal` on store failure.
    pub async fn logout(
        &self,
        token: Option<&str>,
        csrf: &CsrfPresented,
        client: &ClientContext,
    ) -> AccessResult<()> {
        let Some(token) = token else {
            return Ok(());
        };
        let id = self.session_id(token);
        let Some(session) = self.sessions.get(&id).await? else {
            debug!("logout for unknown session");
            return Ok(());
        };

        let binding = CsrfBinding::Session(id.clone());
        self.csrf.verify(csrf, &binding, client).await?;

        self.sessions.delete(&id).await?;
        self.csrf.revoke_binding(&binding).await?;
        self.audit.record(
            AuditEvent::new(AuditAction::Logout, AuditOutcome::Success)
                .actor(&session.subject_id)
                .client(client),
        );
        Ok(())
    }

    /// Resolve a session token, sliding its inactivity window forward.
    ///
    /// # Errors
    /// `Authentication(SessionNotFound | SessionExpired)` or `Internal`.
    pub async fn validate(&self, token: &str, client: &ClientContext) -> AccessResult<Session> {
        let id = self.session_id(token);
        let store = &self.sessions;
        let lookup = id.as_str();
        let Some(mut session) = retry_once("session.get", move || store.get(lookup)).await? else {
            self.audit_validate_failure(None, client, "unknown session");
            return Err(AccessError::Authentication(AuthFailure::SessionNotFound));
        };

        let now = self.clock.now();
        if !session.is_live(now, self.config.inactivity_timeout()) {
            self.destroy(&session).await?;
            self.audit_validate_failure(Some(&session.subject_id), client, "session expired");
            return Err(AccessError::Authentication(AuthFailure::SessionExpired));
        }

        if self.config.refresh_on_validate() {
            let directory = &self.directory;
            let subject = session.subject_id.as_str();
            match retry_once("directory.get", move || directory.get(subject)).await? {
                Some(user) if user.active => {
                    if user.role != session.role {
                        debug!(from = %session.role, to = %user.role, "session role refreshed");
                        session.role = user.role;
                        session.permissions = role_permissions(user.role).to_vec();
                    }
                }
                _ => {
                    self.destroy(&session).await?;
                    self.audit_validate_failure(
                        Some(&session.subject_id),
                        client,
                        "admin inactive or removed",
                    );
                    return Err(AccessError::Authentication(AuthFailure::SessionNotFound));
                }
            }
        }

        session.last_activity_at = now;
        self.sessions.update(&session).await?;
        Ok(session)
    }

    async fn destroy(&self, session: &Session) -> Result<()> {
        self.sessions.delete(&session.id).await?;
        self.csrf
            .revoke_binding(&CsrfBinding::Session(session.id.clone()))
            .await?;
        Ok(())
    }

    fn audit_validate_failure(&self, subject: Option<&str>, client: &ClientContext, detail: &str) {
        let mut event = AuditEvent::new(AuditAction::SessionValidate, AuditOutcome::Failure)
            .client(client)
            .detail(detail);
        if let Some(subject) = subject {
            event = event.actor(subject);
        }
        self.audit.record(event);
    }

    /// Validate and require `permission`.
    ///
    /// # Errors
    /// `Authentication` for a bad session, `Authorization` when the role lacks the permission.
    pub async fn authorize(
        &self,
        token: &str,
        permission: Permission,
        client: &ClientContext,
    ) -> AccessResult<Session> {
        let session = self.validate(token, client).await?;
        self.require_permission(&session, permission, client)?;
        Ok(session)
    }

    /// Check `permission` against an already validated session. Denials are audited.
    ///
    /// # Errors
    /// `Authorization` when the role lacks the permission.
    pub fn require_permission(
        &self,
        session: &Session,
        permission: Permission,
        client: &ClientContext,
    ) -> AccessResult<()> {
        if has_permission(session, permission) {
            return Ok(());
        }
        self.audit.record(
            AuditEvent::new(AuditAction::PermissionCheck, AuditOutcome::Denied)
                .actor(&session.subject_id)
                .client(client)
                .detail(format!("role={} permission={permission}", session.role)),
        );
        Err(AccessError::Authorization)
    }

    /// Gate for state-changing calls: CSRF bound to this session, then `authorize`.
    ///
    /// # Errors
    /// `Csrf`, `Authentication` or `Authorization`.
    pub async fn authorize_mutation(
        &self,
        token: &str,
        csrf: &CsrfPresented,
        permission: Permission,
        client: &ClientContext,
    ) -> AccessResult<Session> {
        let binding = CsrfBinding::Session(self.session_id(token));
        self.csrf.verify(csrf, &binding, client).await?;
        self.authorize(token, permission, client).await
    }

    /// Rotate the CSRF token after a successful mutation.
    ///
    /// # Errors
    /// Returns an error if the CSRF store fails.
    pub async fn complete_mutation(
        &self,
        session: &Session,
        used: &CsrfPresented,
    ) -> AccessResult<IssuedCsrf> {
        Ok(self
            .csrf
            .rotate(
                used.cookie_hash.as_deref(),
                &CsrfBinding::Session(session.id.clone()),
            )
            .await?)
    }

    /// Force-logout every session of `subject_id`. Requires `manage_users`.
    ///
    /// # Errors
    /// Anything `authorize_mutation` returns, or `Validation` for an empty subject.
    pub async fn revoke_subject(
        &self,
        token: &str,
        csrf: &CsrfPresented,
        subject_id: &str,
        client: &ClientContext,
    ) -> AccessResult<RevokeOutcome> {
        let actor = self
            .authorize_mutation(token, csrf, Permission::ManageUsers, client)
            .await?;
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(AccessError::Validation("A subject id is required."));
        }

        let removed = self.sessions.delete_by_subject(subject_id).await?;
        for id in &removed {
            self.csrf
                .revoke_binding(&CsrfBinding::Session(id.clone()))
                .await?;
        }
        let revoked = u64::try_from(removed.len()).unwrap_or(u64::MAX);

        self.audit.record(
            AuditEvent::new(AuditAction::SessionRevoke, AuditOutcome::Success)
                .actor(&actor.subject_id)
                .client(client)
                .detail(format!("subject={subject_id} revoked={revoked}")),
        );

        let csrf = if removed.contains(&actor.id) {
            None
        } else {
            Some(self.complete_mutation(&actor, csrf).await?)
        };
        Ok(RevokeOutcome { revoked, csrf })
    }

    /// Issue a CSRF token: bound to the session when `token` is valid, otherwise anonymous.
    ///
    /// # Errors
    /// `Internal` on store failure. Invalid sessions fall back to anonymous.
    pub async fn issue_csrf(
        &self,
        token: Option<&str>,
        client: &ClientContext,
    ) -> AccessResult<IssuedCsrf> {
        let binding = match token {
            Some(token) => match self.validate(token, client).await {
                Ok(session) => CsrfBinding::Session(session.id),
                Err(AccessError::Authentication(_)) => CsrfBinding::Anonymous,
                Err(err) => return Err(err),
            },
            None => CsrfBinding::Anonymous,
        };
        Ok(self.csrf.issue(&binding).await?)
    }
}

/// Run a read once more if the first attempt fails.
async fn retry_once<T, F, Fut>(operation: &'static str, mut read: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match read().await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(operation, "read failed, retrying once: {err:#}");
            read().await
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("lockout", &self.lockout)
            .finish_non_exhaustive()
    }
}
