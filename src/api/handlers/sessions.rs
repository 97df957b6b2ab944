use axum::{Extension, Json, http::HeaderMap, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

use super::{
    CsrfTokenView, append_cookie, throttle,
    client::Client,
    cookies::{clear_csrf_cookie, clear_session_cookie, csrf_cookie, csrf_presented, session_token},
};
use crate::{
    access::{AccessError, AccessResult, AuthFailure, RouteClass, SessionManager},
    api::error::ErrorBody,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeBody {
    pub subject_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokeResponse {
    pub revoked: u64,
    /// Replacement CSRF token; absent when the caller revoked their own session.
    pub csrf: Option<CsrfTokenView>,
}

#[utoipa::path(
    post,
    path = "/sessions/revoke",
    request_body = RevokeBody,
    params(
        ("x-csrf-token" = String, Header, description = "CSRF token bound to the session")
    ),
    responses(
        (status = 200, description = "Every session of the subject destroyed", body = RevokeResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 401, description = "No valid session", body = ErrorBody),
        (status = 403, description = "CSRF failure or missing manage_users", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn revoke(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
    payload: Option<Json<RevokeBody>>,
) -> AccessResult<impl IntoResponse> {
    throttle(&manager, RouteClass::AdminApi, &client).await?;
    let Some(Json(body)) = payload else {
        return Err(AccessError::Validation("A subject id is required."));
    };
    let token = session_token(&headers)
        .ok_or(AccessError::Authentication(AuthFailure::SessionNotFound))?;

    let outcome = manager
        .revoke_subject(&token, &csrf_presented(&headers), &body.subject_id, &client)
        .await?;
    info!(subject = %body.subject_id, revoked = outcome.revoked, "sessions revoked");

    let secure = manager.config().secure_cookies();
    let mut response_headers = HeaderMap::new();
    match &outcome.csrf {
        Some(issued) => append_cookie(&mut response_headers, csrf_cookie(&issued.cookie_hash, secure))?,
        None => {
            append_cookie(&mut response_headers, clear_session_cookie(secure))?;
            append_cookie(&mut response_headers, clear_csrf_cookie(secure))?;
        }
    }

    Ok((
        response_headers,
        Json(RevokeResponse {
            revoked: outcome.revoked,
            csrf: outcome.csrf.as_ref().map(CsrfTokenView::from),
        }),
    ))
}
