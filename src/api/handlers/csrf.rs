use axum::{Extension, Json, http::HeaderMap, response::IntoResponse};
use std::sync::Arc;

use super::{
    CsrfTokenView, append_cookie, throttle,
    client::Client,
    cookies::{csrf_cookie, session_token},
};
use crate::{
    access::{AccessResult, RouteClass, SessionManager},
    api::error::ErrorBody,
};

/// Bound to the caller's session when the session cookie is valid, anonymous otherwise.
#[utoipa::path(
    get,
    path = "/csrf-token",
    responses(
        (status = 200, description = "Fresh CSRF token; hash set in the CSRF cookie", body = CsrfTokenView),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn csrf_token(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
) -> AccessResult<impl IntoResponse> {
    throttle(&manager, RouteClass::GeneralApi, &client).await?;

    let token = session_token(&headers);
    let issued = manager.issue_csrf(token.as_deref(), &client).await?;

    let mut response_headers = HeaderMap::new();
    append_cookie(
        &mut response_headers,
        csrf_cookie(&issued.cookie_hash, manager.config().secure_cookies()),
    )?;
    Ok((response_headers, Json(CsrfTokenView::from(&issued))))
}
