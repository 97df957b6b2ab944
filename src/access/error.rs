//! Error taxonomy for the access core.
//!
//! Every variant maps to a stable `kind` and a message that is safe to return
//! to clients. Collaborator and store detail stays inside `Internal` and is
//! only ever logged.

use chrono::{DateTime, Utc};

/// Why an authentication attempt or session lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Unknown email, wrong password, or inactive account. Deliberately indistinguishable.
    InvalidCredentials,
    SessionExpired,
    SessionNotFound,
}

/// Why a CSRF check failed. Only logged; clients always see the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    MissingToken,
    MissingCookie,
    Mismatch,
    Expired,
    Unbound,
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("validation failed: {0}")]
    Validation(&'static str),
    #[error("authentication failed: {0:?}")]
    Authentication(AuthFailure),
    #[error("permission denied")]
    Authorization,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("account locked until {locked_until}")]
    Locked {
        locked_until: DateTime<Utc>,
        retry_after_ms: u64,
    },
    #[error("csrf verification failed: {0:?}")]
    Csrf(CsrfFailure),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AccessError {
    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::Authentication(AuthFailure::InvalidCredentials)
    }

    /// Stable machine-readable kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authentication(_) => "authentication",
            Self::Authorization => "authorization",
            Self::RateLimited { .. } => "rate_limit",
            Self::Locked { .. } => "lockout",
            Self::Csrf(_) => "csrf",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show to any client.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::Validation(message) => (*message).to_string(),
            Self::Authentication(AuthFailure::InvalidCredentials) => {
                "Invalid email or password.".to_string()
            }
            Self::Authentication(AuthFailure::SessionExpired) => "Session expired.".to_string(),
            Self::Authentication(AuthFailure::SessionNotFound) => {
                "Authentication required.".to_string()
            }
            Self::Authorization => "Permission denied.".to_string(),
            Self::RateLimited { .. } => "Too many requests.".to_string(),
            Self::Locked { retry_after_ms, .. } => {
                let minutes = retry_after_ms.div_ceil(60_000);
                format!("Too many failed attempts. Try again in {minutes} minute(s).")
            }
            Self::Csrf(_) => "Invalid or missing CSRF token.".to_string(),
            Self::Internal(_) => "Internal error.".to_string(),
        }
    }

    /// Retry hint in milliseconds for throttling errors.
    #[must_use]
    pub const fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } | Self::Locked { retry_after_ms, .. } => {
                Some(*retry_after_ms)
            }
            _ => None,
        }
    }
}

pub type AccessResult<T> = Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_credentials_message_does_not_leak_cause() {
        let err = AccessError::invalid_credentials();
        assert_eq!(err.kind(), "authentication");
        assert_eq!(err.safe_message(), "Invalid email or password.");
    }

    #[test]
    fn internal_error_hides_detail() {
        let err = AccessError::from(anyhow::anyhow!("connection refused: 10.0.0.5:5432"));
        assert_eq!(err.kind(), "internal");
        assert!(!err.safe_message().contains("10.0.0.5"));
    }

    #[test]
    fn locked_message_rounds_minutes_up() {
        let err = AccessError::Locked {
            locked_until: Utc::now(),
            retry_after_ms: 61_000,
        };
        assert_eq!(err.retry_after_ms(), Some(61_000));
        assert!(err.safe_message().contains("2 minute(s)"));
    }

    #[test]
    fn csrf_failures_share_one_message() {
        assert_eq!(
            AccessError::Csrf(CsrfFailure::Expired).safe_message(),
            AccessError::Csrf(CsrfFailure::Mismatch).safe_message()
        );
    }
}
