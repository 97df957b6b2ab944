//! Small helpers for identifier normalization and opaque token handling.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use regex::Regex;
use sha2::Sha256;
use std::sync::LazyLock;

pub(crate) type HmacSha256 = Hmac<Sha256>;

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// Normalize an email for lookup and counter keys.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    EMAIL
        .as_ref()
        .is_some_and(|regex| regex.is_match(email_normalized))
}

/// 32 random bytes from the OS, URL-safe base64 without padding.
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Keyed hash of a session token; only this value is ever stored.
pub(crate) fn hash_session_token(secret: &[u8], token: &str) -> String {
    Base64UrlUnpadded::encode_string(&hmac_sha256(secret, token.as_bytes()))
}

pub(crate) fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    // Any key length is valid for HMAC.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}
