use axum::{
    Extension, Json,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{
    SessionView, append_cookie, throttle,
    client::Client,
    cookies::{clear_csrf_cookie, clear_session_cookie, csrf_presented, session_token},
};
use crate::{
    access::{AccessError, AccessResult, AuthFailure, RouteClass, SessionManager},
    api::error::ErrorBody,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Current session", body = SessionView),
        (status = 401, description = "No valid session", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn session(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
) -> AccessResult<Json<SessionView>> {
    throttle(&manager, RouteClass::GeneralApi, &client).await?;
    let token = session_token(&headers)
        .ok_or(AccessError::Authentication(AuthFailure::SessionNotFound))?;
    let session = manager.validate(&token, &client).await?;
    Ok(Json(SessionView::from(&session)))
}

#[utoipa::path(
    delete,
    path = "/session",
    params(
        ("x-csrf-token" = String, Header, description = "CSRF token bound to the session")
    ),
    responses(
        (status = 200, description = "Logged out; cookies cleared", body = LogoutResponse),
        (status = 403, description = "CSRF check failed", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn logout(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
) -> AccessResult<impl IntoResponse> {
    let token = session_token(&headers);
    manager
        .logout(token.as_deref(), &csrf_presented(&headers), &client)
        .await?;

    let secure = manager.config().secure_cookies();
    let mut response_headers = HeaderMap::new();
    append_cookie(&mut response_headers, clear_session_cookie(secure))?;
    append_cookie(&mut response_headers, clear_csrf_cookie(secure))?;
    Ok((
        StatusCode::OK,
        response_headers,
        Json(LogoutResponse {
            status: "logged_out".to_string(),
        }),
    ))
}
