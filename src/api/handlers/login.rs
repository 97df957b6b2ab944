use axum::{
    Extension, Json,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::info;
use utoipa::ToSchema;

use super::{
    CsrfTokenView, SessionView, append_cookie,
    client::Client,
    cookies::{csrf_cookie, csrf_presented, session_cookie},
};
use crate::{
    access::{AccessError, AccessResult, LoginRequest, SessionManager},
    api::error::ErrorBody,
};

#[derive(Deserialize, ToSchema)]
pub struct LoginBody {
    pub email: String,
    #[schema(value_type = String, format = Password)]
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

impl fmt::Debug for LoginBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginBody")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub session: SessionView,
    pub csrf: CsrfTokenView,
}

#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginBody,
    params(
        ("x-csrf-token" = String, Header, description = "Pre-login CSRF token from GET /csrf-token")
    ),
    responses(
        (status = 200, description = "Session issued; session and CSRF cookies set", body = LoginResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 403, description = "CSRF check failed", body = ErrorBody),
        (status = 429, description = "Rate limited or locked out; see Retry-After", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
    payload: Option<Json<LoginBody>>,
) -> AccessResult<impl IntoResponse> {
    let csrf = csrf_presented(&headers);
    let Some(Json(body)) = payload else {
        return Err(AccessError::Validation("Email and password are required."));
    };

    let request = LoginRequest {
        email: body.email,
        password: SecretString::from(body.password),
        remember_me: body.remember_me,
    };
    let outcome = manager.login(request, &csrf, &client).await?;

    let secure = manager.config().secure_cookies();
    let max_age = (outcome.session.expires_at - outcome.session.created_at).num_seconds();
    let mut response_headers = HeaderMap::new();
    append_cookie(
        &mut response_headers,
        session_cookie(&outcome.session_token, max_age, secure),
    )?;
    append_cookie(
        &mut response_headers,
        csrf_cookie(&outcome.csrf.cookie_hash, secure),
    )?;

    info!(subject = %outcome.user.id, role = %outcome.user.role, "admin logged in");

    let body = LoginResponse {
        session: SessionView::from(&outcome.session),
        csrf: CsrfTokenView::from(&outcome.csrf),
    };
    Ok((StatusCode::OK, response_headers, Json(body)))
}
