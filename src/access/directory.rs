//! Contracts for the two external collaborators: the identity provider that checks
//! passwords and the user directory that owns admin records.
//!
//! Both return `Ok(None)` for "not valid / not found" and reserve `Err` for
//! infrastructure failures, so callers can tell a wrong password from an outage.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, time::Duration};
use subtle::ConstantTimeEq;
use tracing::{Instrument, debug, info_span};
use url::Url;
use utoipa::ToSchema;

use super::rbac::{Permission, Role, role_permissions};

/// Admin account as stored by the user directory. Permissions are derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl AdminUser {
    #[must_use]
    pub fn permissions(&self) -> &'static [Permission] {
        role_permissions(self.role)
    }
}

/// Proof from the identity provider that a credential pair is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Assertion {
    pub subject_id: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the credentials are wrong or the account is unknown.
    async fn verify_credentials(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Assertion>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get(&self, subject_id: &str) -> Result<Option<AdminUser>>;

    async fn touch_last_login(&self, subject_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Identity provider reached over HTTP.
///
/// `POST {base}/verify` with `{"email", "password"}`. `200 {"subject_id"}` means valid;
/// 401, 403 and 404 mean invalid; anything else is an error.
pub struct HttpIdentityProvider {
    client: Client,
    verify_url: Url,
}

impl HttpIdentityProvider {
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).context("invalid identity provider URL")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let verify_url = base
            .join("verify")
            .context("failed to build identity provider verify URL")?;
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build identity provider client")?;
        Ok(Self { client, verify_url })
    }

    #[must_use]
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    email: &'a str,
    password: &'a str,
}

impl HttpIdentityProvider {
    async fn send_verify(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Assertion>> {
        let response = self
            .client
            .post(self.verify_url.clone())
            .json(&VerifyRequest {
                email,
                password: password.expose_secret(),
            })
            .send()
            .await
            .context("identity provider request failed")?;

        match response.status() {
            StatusCode::OK => {
                let assertion: Assertion = response
                    .json()
                    .await
                    .context("identity provider returned an invalid body")?;
                Ok(Some(assertion))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!(status = %response.status(), "identity provider rejected credentials");
                Ok(None)
            }
            status => Err(anyhow!("identity provider returned {status}")),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Assertion>> {
        let span = info_span!(
            "identity.verify",
            http.method = "POST",
            url.full = %self.verify_url
        );
        self.send_verify(email, password).instrument(span).await
    }
}

impl fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("verify_url", &self.verify_url.as_str())
            .finish_non_exhaustive()
    }
}

struct Credential {
    subject_id: String,
    password_digest: [u8; 32],
}

/// In-process identity provider for tests and local development.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    accounts: DashMap<String, Credential>,
}

fn password_digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

impl MemoryIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_account(self, email: &str, password: &str, subject_id: &str) -> Self {
        self.set_password(email, password, subject_id);
        self
    }

    pub fn set_password(&self, email: &str, password: &str, subject_id: &str) {
        self.accounts.insert(
            email.trim().to_lowercase(),
            Credential {
                subject_id: subject_id.to_string(),
                password_digest: password_digest(password),
            },
        );
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Assertion>> {
        let presented = password_digest(password.expose_secret());
        let Some(account) = self.accounts.get(email) else {
            // Same amount of work for unknown accounts.
            let _ = presented[..].ct_eq(&[0u8; 32][..]);
            return Ok(None);
        };
        if bool::from(presented[..].ct_eq(&account.password_digest[..])) {
            Ok(Some(Assertion {
                subject_id: account.subject_id.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl fmt::Debug for MemoryIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIdentityProvider")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashMap<String, AdminUser>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(self, user: AdminUser) -> Self {
        self.insert(user);
        self
    }

    pub fn insert(&self, user: AdminUser) {
        self.users.insert(user.id.clone(), user);
    }

    /// Returns `false` when the user does not exist.
    pub fn set_active(&self, subject_id: &str, active: bool) -> bool {
        self.users
            .get_mut(subject_id)
            .map(|mut user| user.active = active)
            .is_some()
    }

    /// Returns `false` when the user does not exist.
    pub fn set_role(&self, subject_id: &str, role: Role) -> bool {
        self.users
            .get_mut(subject_id)
            .map(|mut user| user.role = role)
            .is_some()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn get(&self, subject_id: &str) -> Result<Option<AdminUser>> {
        Ok(self.users.get(subject_id).map(|user| user.value().clone()))
    }

    async fn touch_last_login(&self, subject_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut user) = self.users.get_mut(subject_id) {
            user.last_login_at = Some(at);
        }
        Ok(())
    }
}
