//! Administrative access-control core.
//!
//! Everything here is transport-agnostic; `crate::api` binds it to HTTP.
//! Components, leaves first: counter store, CSRF protector, rate limiter,
//! lockout guard, RBAC evaluator, session manager, audit logger.

pub mod audit;
pub mod clock;
pub mod config;
pub mod counter;
pub mod csrf;
pub mod directory;
pub mod error;
pub mod lockout;
pub mod rate_limit;
pub mod rbac;
pub mod reclaim;
pub mod session;
pub(crate) mod utils;

pub use audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, AuditRecord, ClientContext};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AccessConfig;
pub use counter::{CounterStore, CounterValue, MemoryCounterStore};
pub use csrf::{CsrfBinding, CsrfPresented, CsrfStore, IssuedCsrf, MemoryCsrfStore};
pub use directory::{
    AdminUser, Assertion, HttpIdentityProvider, IdentityProvider, MemoryIdentityProvider,
    MemoryUserDirectory, UserDirectory,
};
pub use error::{AccessError, AccessResult, AuthFailure, CsrfFailure};
pub use lockout::{LockoutPolicy, LockoutScope};
pub use rate_limit::{RateLimitRule, RateLimitTable, RouteClass};
pub use rbac::{Permission, Role};
pub use session::{
    AccessStores, LoginOutcome, LoginRequest, MemorySessionStore, Session, SessionManager,
    SessionStore,
};
