use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::ledger::LedgerError;
use crate::store::StoreError;

/// An error response: `{"errorCode": ..., "errorMsg": ...}` with a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn invalid_key() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalidKey", "Application not authorized")
    }

    pub fn no_key() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "noKey", "No API Key provided")
    }

    pub fn invalid_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalidToken", "Valid session token required")
    }

    pub fn invalid_body() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalidBody", "Bad request")
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "badRequest", msg)
    }

    pub fn misconfigured() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "misconfigured",
            "Server misconfigured",
        )
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "Server error")
    }

    pub fn taken() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "taken", "Username or email already used")
    }

    pub fn password() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "password", "Invalid password")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "notFound", "Not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"errorCode": self.code, "errorMsg": self.msg})),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if e.is_not_found() {
            return ApiError::not_found();
        }
        tracing::error!(error = %e, "internal error");
        ApiError::internal()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Misconfigured { app_id, table } => {
                tracing::error!(%app_id, table, "server misconfigured: app is missing a table");
                ApiError::misconfigured()
            }
            LedgerError::Store(e) => e.into(),
        }
    }
}
