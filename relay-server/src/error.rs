use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_shared::ErrorDetail;

use crate::llm::UpstreamError;

pub const RATE_LIMIT_DETAIL: &str = "Rate limit exceeded. Try again later.";
pub const AUTHENTICATION_DETAIL: &str = "Authentication failed. Your API key is not valid.";
pub const CONNECTION_DETAIL: &str = "API connection error. Please check your internet connection.";

/// An error response with a `{"detail": ...}` JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        let (status, detail) = match err {
            UpstreamError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_DETAIL.to_string()),
            UpstreamError::Authentication(_) => (StatusCode::UNAUTHORIZED, AUTHENTICATION_DETAIL.to_string()),
            UpstreamError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, CONNECTION_DETAIL.to_string()),
            UpstreamError::Other(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("An unexpected error occurred during the upstream API call: {message}"),
            ),
        };
        Self { status, detail }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorDetail { detail: self.detail })).into_response()
    }
}
