//! Double-submit CSRF protection.
//!
//! Flow Overview:
//! 1) `issue` creates `<random>.<issued_at>` and its keyed hash. The token goes to the
//!    client in the response body; the hash goes into an `HttpOnly` cookie and into the
//!    server-side store, bound to either the anonymous pre-login context or a session.
//! 2) A mutating request echoes the token in `X-CSRF-Token`. `verify_token` recomputes the
//!    hash, compares it with the cookie in constant time and checks the 24h lifetime.
//! 3) Bound verification additionally requires the hash to still be stored under the
//!    expected binding, so rotation and logout invalidate older tokens.
//!
//! Every missing piece fails closed.

use anyhow::Result;
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::Mac;
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, sync::Arc};
use tracing::debug;

use super::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, ClientContext},
    clock::Clock,
    error::{AccessError, AccessResult, CsrfFailure},
    utils::{HmacSha256, generate_token, hmac_sha256},
};

pub const CSRF_TOKEN_TTL_HOURS: i64 = 24;

#[must_use]
pub fn csrf_token_ttl() -> Duration {
    Duration::hours(CSRF_TOKEN_TTL_HOURS)
}

/// What a token is bound to server-side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CsrfBinding {
    Anonymous,
    Session(String),
}

impl CsrfBinding {
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::Session(id) => format!("session:{id}"),
        }
    }
}

/// A freshly issued token. `token` goes in the body, `cookie_hash` in the cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCsrf {
    pub token: String,
    pub cookie_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCsrf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCsrf")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Token and cookie as presented by a client. Either may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrfPresented {
    pub token: Option<String>,
    pub cookie_hash: Option<String>,
}

impl CsrfPresented {
    #[must_use]
    pub fn new(token: Option<String>, cookie_hash: Option<String>) -> Self {
        Self { token, cookie_hash }
    }
}

/// Server-side binding of a token hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrfRecord {
    pub hash: String,
    pub binding: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CsrfStore: Send + Sync + fmt::Debug {
    async fn put(&self, record: CsrfRecord) -> Result<()>;

    async fn get(&self, hash: &str) -> Result<Option<CsrfRecord>>;

    async fn remove(&self, hash: &str) -> Result<()>;

    /// Drop every token bound to `binding`. Returns how many were removed.
    async fn remove_binding(&self, binding: &str) -> Result<u64>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryCsrfStore {
    records: DashMap<String, CsrfRecord>,
}

impl MemoryCsrfStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CsrfStore for MemoryCsrfStore {
    async fn put(&self, record: CsrfRecord) -> Result<()> {
        self.records.insert(record.hash.clone(), record);
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<CsrfRecord>> {
        Ok(self.records.get(hash).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        self.records.remove(hash);
        Ok(())
    }

    async fn remove_binding(&self, binding: &str) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| record.binding != binding);
        Ok(u64::try_from(before.saturating_sub(self.records.len())).unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(u64::try_from(before.saturating_sub(self.records.len())).unwrap_or(0))
    }
}

/// `HMAC-SHA256(secret, token)`, URL-safe base64.
#[must_use]
pub fn hash_token(secret: &[u8], token: &str) -> String {
    Base64UrlUnpadded::encode_string(&hmac_sha256(secret, token.as_bytes()))
}

/// Stateless check of a presented token against the cookie hash.
///
/// # Errors
/// Returns the reason the pair was rejected.
pub fn check_token(
    token: &str,
    cookie_hash: &str,
    secret: &[u8],
    now: DateTime<Utc>,
) -> Result<(), CsrfFailure> {
    if token.is_empty() {
        return Err(CsrfFailure::MissingToken);
    }
    if cookie_hash.is_empty() {
        return Err(CsrfFailure::MissingCookie);
    }
    let expected =
        Base64UrlUnpadded::decode_vec(cookie_hash).map_err(|_| CsrfFailure::Mismatch)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| CsrfFailure::Mismatch)?;
    mac.update(token.as_bytes());
    // `verify_slice` compares in constant time.
    mac.verify_slice(&expected)
        .map_err(|_| CsrfFailure::Mismatch)?;

    let issued_at = token
        .rsplit_once('.')
        .and_then(|(_, issued)| issued.parse::<i64>().ok())
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .ok_or(CsrfFailure::Mismatch)?;
    if now.signed_duration_since(issued_at) > csrf_token_ttl() {
        return Err(CsrfFailure::Expired);
    }
    Ok(())
}

/// Boolean form of [`check_token`].
#[must_use]
pub fn verify_token(token: &str, cookie_hash: &str, secret: &[u8], now: DateTime<Utc>) -> bool {
    check_token(token, cookie_hash, secret, now).is_ok()
}

pub struct CsrfProtector {
    store: Arc<dyn CsrfStore>,
    secret: SecretString,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl CsrfProtector {
    #[must_use]
    pub fn new(
        store: Arc<dyn CsrfStore>,
        secret: SecretString,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            secret,
            audit,
            clock,
        }
    }

    /// Issue a token bound to `binding`.
    ///
    /// # Errors
    /// Returns an error if randomness or the store fails.
    pub async fn issue(&self, binding: &CsrfBinding) -> Result<IssuedCsrf> {
        let issued_at = self.clock.now();
        let token = format!("{}.{}", generate_token()?, issued_at.timestamp());
        let cookie_hash = hash_token(self.secret.expose_secret().as_bytes(), &token);
        let expires_at = issued_at + csrf_token_ttl();

        self.store
            .put(CsrfRecord {
                hash: cookie_hash.clone(),
                binding: binding.key(),
                issued_at,
                expires_at,
            })
            .await?;

        Ok(IssuedCsrf {
            token,
            cookie_hash,
            issued_at,
            expires_at,
        })
    }

    /// Verify a presented pair and its server-side binding. Failures are audited.
    ///
    /// # Errors
    /// `AccessError::Csrf` on any rejection, `AccessError::Internal` on store failure.
    pub async fn verify(
        &self,
        presented: &CsrfPresented,
        expected: &CsrfBinding,
        client: &ClientContext,
    ) -> AccessResult<CsrfRecord> {
        match self.verify_inner(presented, expected).await {
            Ok(record) => Ok(record),
            Err(AccessError::Csrf(failure)) => {
                debug!(?failure, binding = %expected.key(), "csrf verification failed");
                self.audit.record(
                    AuditEvent::new(AuditAction::CsrfVerify, AuditOutcome::Denied)
                        .client(client)
                        .detail(format!("{failure:?}")),
                );
                Err(AccessError::Csrf(failure))
            }
            Err(err) => Err(err),
        }
    }

    async fn verify_inner(
        &self,
        presented: &CsrfPresented,
        expected: &CsrfBinding,
    ) -> AccessResult<CsrfRecord> {
        let token = presented
            .token
            .as_deref()
            .ok_or(AccessError::Csrf(CsrfFailure::MissingToken))?;
        let cookie_hash = presented
            .cookie_hash
            .as_deref()
            .ok_or(AccessError::Csrf(CsrfFailure::MissingCookie))?;
        let now = self.clock.now();

        check_token(token, cookie_hash, self.secret.expose_secret().as_bytes(), now)
            .map_err(AccessError::Csrf)?;

        let record = self
            .store
            .get(cookie_hash)
            .await?
            .ok_or(AccessError::Csrf(CsrfFailure::Unbound))?;
        if record.binding != expected.key() {
            return Err(AccessError::Csrf(CsrfFailure::Unbound));
        }
        if record.expires_at <= now {
            self.store.remove(cookie_hash).await?;
            return Err(AccessError::Csrf(CsrfFailure::Expired));
        }
        Ok(record)
    }

    /// Replace the token identified by `previous_hash` with a new one bound to `binding`.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn rotate(
        &self,
        previous_hash: Option<&str>,
        binding: &CsrfBinding,
    ) -> Result<IssuedCsrf> {
        if let Some(hash) = previous_hash {
            self.store.remove(hash).await?;
        }
        self.issue(binding).await
    }

    /// Invalidate every token bound to `binding`.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_binding(&self, binding: &CsrfBinding) -> Result<u64> {
        self.store.remove_binding(&binding.key()).await
    }
}

impl fmt::Debug for CsrfProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfProtector")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
