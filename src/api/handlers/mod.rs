//! HTTP handlers.
//!
//! Handlers stay thin: extract cookies, headers and the client context, call the
//! `SessionManager`, map the outcome. All decisions live in `crate::access`.

pub mod audit;
pub mod client;
pub mod cookies;
pub mod csrf;
pub mod health;
pub mod login;
pub mod session;
pub mod sessions;

use axum::http::{
    HeaderMap, HeaderValue,
    header::{InvalidHeaderValue, SET_COOKIE},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::access::{
    AccessError, AccessResult, ClientContext, IssuedCsrf, Permission, Role, RouteClass, Session,
    SessionManager,
};

const UNKNOWN_CLIENT: &str = "unknown";

/// The admin as seen by the front end.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub role: Role,
}

/// Current session and its effective permissions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionView {
    pub user: SessionUser,
    pub permissions: Vec<Permission>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            user: SessionUser {
                id: session.subject_id.clone(),
                email: session.email.clone(),
                role: session.role,
            },
            permissions: session.permissions.clone(),
            expires_at: session.expires_at,
            remember_me: session.remember_me,
        }
    }
}

/// A CSRF token to echo back in `X-CSRF-Token`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CsrfTokenView {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&IssuedCsrf> for CsrfTokenView {
    fn from(issued: &IssuedCsrf) -> Self {
        Self {
            token: issued.token.clone(),
            expires_at: issued.expires_at,
        }
    }
}

pub(crate) async fn throttle(
    manager: &SessionManager,
    route: RouteClass,
    client: &ClientContext,
) -> AccessResult<()> {
    let key = client.ip.as_deref().unwrap_or(UNKNOWN_CLIENT);
    manager.enforce_rate_limit(key, route, client).await?;
    Ok(())
}

pub(crate) fn append_cookie(
    headers: &mut HeaderMap,
    cookie: Result<HeaderValue, InvalidHeaderValue>,
) -> AccessResult<()> {
    let value = cookie.map_err(|err| AccessError::Internal(err.into()))?;
    headers.append(SET_COOKIE, value);
    Ok(())
}
