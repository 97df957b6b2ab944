//! HTTP mapping for `AccessError`.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::access::error::AccessError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[must_use]
pub fn status_for(err: &AccessError) -> StatusCode {
    match err {
        AccessError::Validation(_) => StatusCode::BAD_REQUEST,
        AccessError::Authentication(_) => StatusCode::UNAUTHORIZED,
        AccessError::Authorization | AccessError::Csrf(_) => StatusCode::FORBIDDEN,
        AccessError::RateLimited { .. } | AccessError::Locked { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        AccessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        match &self {
            AccessError::Internal(err) => error!("access core failure: {err:#}"),
            AccessError::Csrf(failure) => warn!(?failure, "csrf rejected"),
            _ => {}
        }

        let status = status_for(&self);
        let body = ErrorBody {
            kind: self.kind().to_string(),
            message: self.safe_message(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(ms) = self.retry_after_ms() {
            // Whole seconds, rounded up so clients never retry early.
            let seconds = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::error::{AuthFailure, CsrfFailure};
    use anyhow::Result;
    use chrono::Utc;
    use http_body_util::BodyExt;

    #[test]
    fn statuses_follow_error_kind() {
        assert_eq!(
            status_for(&AccessError::Validation("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AccessError::Authentication(AuthFailure::SessionExpired)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(&AccessError::Authorization), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&AccessError::Csrf(CsrfFailure::Mismatch)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&AccessError::Internal(anyhow::anyhow!("db down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn throttling_sets_retry_after_in_seconds() {
        let response = AccessError::RateLimited {
            retry_after_ms: 1_500,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from_static("2"))
        );

        let locked = AccessError::Locked {
            locked_until: Utc::now(),
            retry_after_ms: 900_000,
        }
        .into_response();
        assert_eq!(
            locked.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from_static("900"))
        );
    }

    #[tokio::test]
    async fn internal_detail_is_not_returned() -> Result<()> {
        let response =
            AccessError::Internal(anyhow::anyhow!("password=hunter2 rejected")).into_response();
        let bytes = response.into_body().collect().await?.to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes)?;
        assert_eq!(body.kind, "internal");
        assert!(!body.message.contains("hunter2"));
        Ok(())
    }
}
