use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Error body, shaped like the rest of the platform's API errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
    pub detail: String,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("No user_id in request")]
    MissingUserId,
    #[error("No org_id in request")]
    MissingOrgId,
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("flag streaming is disabled")]
    StreamDisabled,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlagError {
    /// Returns (error_code, status_code) for this error.
    fn error_metadata(&self) -> (&'static str, StatusCode) {
        match self {
            FlagError::MissingUserId => ("missing_user_id", StatusCode::BAD_REQUEST),
            FlagError::MissingOrgId => ("missing_org_id", StatusCode::BAD_REQUEST),
            FlagError::RequestDecodingError(_) => {
                ("request_decoding_error", StatusCode::BAD_REQUEST)
            }
            FlagError::RequestParsingError(_) => ("request_parsing_error", StatusCode::BAD_REQUEST),
            FlagError::StreamDisabled => ("stream_disabled", StatusCode::SERVICE_UNAVAILABLE),
            FlagError::Internal(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Returns a short error code for canonical logging.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_metadata().1
    }

    pub fn is_5xx(&self) -> bool {
        self.status_code().is_server_error()
    }

    fn detail(&self) -> String {
        match self {
            FlagError::MissingUserId => {
                "The user_id parameter is missing from the request. Please include the authenticated user's id.".to_string()
            }
            FlagError::MissingOrgId => {
                "The org_id parameter is missing from the request. Please include the user's organization id.".to_string()
            }
            FlagError::RequestDecodingError(msg) => {
                format!("Failed to decode request: {msg}. Please check your request format and try again.")
            }
            FlagError::RequestParsingError(err) => {
                format!("Failed to parse request: {err}. Please ensure your request is properly formatted.")
            }
            FlagError::StreamDisabled => {
                "Flag streaming is disabled on this server. Please poll /flags instead.".to_string()
            }
            FlagError::Internal(_) => {
                "An internal server error occurred. Please try again later or contact support if the problem persists.".to_string()
            }
        }
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let (code, status) = self.error_metadata();

        if self.is_5xx() {
            tracing::error!(code, "Flag request failed: {}", self);
        } else {
            tracing::debug!(code, "Rejected flag request: {}", self);
        }

        let body = ErrorResponse {
            error_type: if self.is_5xx() {
                "server_error"
            } else {
                "validation_error"
            },
            code,
            detail: self.detail(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(FlagError::MissingUserId.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(FlagError::MissingOrgId.error_code(), "missing_org_id");
        assert!(!FlagError::MissingOrgId.is_5xx());
        assert!(FlagError::StreamDisabled.is_5xx());
        assert!(FlagError::Internal("boom".to_string()).is_5xx());
    }

    #[test]
    fn test_internal_detail_does_not_leak_message() {
        let detail = FlagError::Internal("secret connection string".to_string()).detail();
        assert!(!detail.contains("secret"));
    }

    #[test]
    fn test_into_response_status() {
        let response = FlagError::StreamDisabled.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
