use axum::{
    Extension, Json,
    extract::Query,
    http::HeaderMap,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

use super::{
    throttle,
    client::Client,
    cookies::{session_token},
};
use crate::{
    access::{AccessError, AccessResult, AuditRecord, AuthFailure, Permission, RouteClass, SessionManager},
    api::error::ErrorBody,
};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditQuery {
    /// Maximum number of events, newest first.
    pub limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/audit/events",
    params(AuditQuery),
    responses(
        (status = 200, description = "Recent audit events, newest first", body = [AuditRecord]),
        (status = 401, description = "No valid session", body = ErrorBody),
        (status = 403, description = "Missing view_audit_log", body = ErrorBody)
    ),
    tag = "audit"
)]
pub async fn events(
    Client(client): Client,
    headers: HeaderMap,
    manager: Extension<Arc<SessionManager>>,
    Query(query): Query<AuditQuery>,
) -> AccessResult<Json<Vec<AuditRecord>>> {
    throttle(&manager, RouteClass::AdminApi, &client).await?;
    let token = session_token(&headers)
        .ok_or(AccessError::Authentication(AuthFailure::SessionNotFound))?;
    manager
        .authorize(&token, Permission::ViewAuditLog, &client)
        .await?;

    let audit = manager.audit();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, audit.capacity());
    Ok(Json(audit.recent(limit)))
}
