//! # Vestibule (Back-office Access Control)
//!
//! `vestibule` guards the administrative back office of the wedding site. It
//! verifies admin credentials against an external identity provider, issues
//! and validates sessions, and enforces the protections every admin request
//! passes through before any business handler runs.
//!
//! ## Request Pipeline
//!
//! 1. **CSRF:** mutating requests must echo a double-submit token whose HMAC
//!    matches the `HttpOnly` CSRF cookie and the server-side binding.
//! 2. **Rate limiting:** per identifier and route class, atomic against the
//!    shared counter store.
//! 3. **Lockout:** login only; 5 failures inside 15 minutes suspend the
//!    identifier for 15 minutes.
//! 4. **Credentials:** delegated to the identity provider, then the admin
//!    record is loaded from the user directory.
//! 5. **RBAC:** every protected operation declares a permission; the role
//!    table is a compile-time exhaustive match.
//!
//! Every branch emits an audit event. Audit writes never block callers.
//!
//! ## Deployment
//!
//! The in-memory stores are correct for a single instance only. Running more
//! than one instance requires the Postgres stores so lockout, rate limits,
//! sessions and CSRF bindings are shared.

pub mod access;
pub mod api;
pub mod cli;
pub mod storage;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
