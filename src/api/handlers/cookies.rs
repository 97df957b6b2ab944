//! Cookie and header plumbing shared by the handlers.
//!
//! The session cookie carries the opaque session token. The CSRF cookie carries
//! the HMAC of the CSRF token, never the token itself; the token travels in the
//! `x-csrf-token` header. Both cookies are `HttpOnly` and `SameSite=Strict`.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};

use crate::access::{CsrfPresented, csrf::CSRF_TOKEN_TTL_HOURS};

pub const SESSION_COOKIE_NAME: &str = "vestibule_session";
pub const CSRF_COOKIE_NAME: &str = "vestibule_csrf";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

fn cookie(name: &str, value: &str, max_age: i64, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn session_cookie(
    token: &str,
    max_age_seconds: i64,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(SESSION_COOKIE_NAME, token, max_age_seconds.max(0), secure)
}

pub fn clear_session_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(SESSION_COOKIE_NAME, "", 0, secure)
}

pub fn csrf_cookie(cookie_hash: &str, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(CSRF_COOKIE_NAME, cookie_hash, CSRF_TOKEN_TTL_HOURS * 3600, secure)
}

pub fn clear_csrf_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(CSRF_COOKIE_NAME, "", 0, secure)
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == name && !val.trim().is_empty()).then(|| val.trim().to_string())
        })
}

pub fn session_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, SESSION_COOKIE_NAME)
}

pub fn csrf_presented(headers: &HeaderMap) -> CsrfPresented {
    let token = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    CsrfPresented::new(token, read_cookie(headers, CSRF_COOKIE_NAME))
}
