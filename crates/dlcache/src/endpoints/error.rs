use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dlcache_service::error::ProxyError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ProxyError> for ResponseError {
    fn from(err: ProxyError) -> Self {
        let status = match err {
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::PathEscape(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::OriginUnreachable(_) | ProxyError::OriginTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::OriginBadStatus(_)
            | ProxyError::OriginTruncated { .. }
            | ProxyError::OriginRead(_) => StatusCode::BAD_GATEWAY,
        };

        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<axum::http::Error> for ResponseError {
    fn from(err: axum::http::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from the proxy.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
