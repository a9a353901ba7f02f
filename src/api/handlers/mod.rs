pub mod admission;
pub use self::admission::{admission, global_admission, Admission, CallerIdentity};

pub mod chat;
pub mod health;
pub mod login;
pub mod verify;

// common response helpers for the handlers
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::verify::VerifyError;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorData {
    pub error: String,
    #[serde(rename = "queryId", skip_serializing_if = "Option::is_none", default)]
    pub query_id: Option<String>,
}

/// Envelope returned for every failure: `{"code": n, "data": {"error": ..}}`.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u8,
    pub data: ErrorData,
}

/// Only admission denials change the HTTP status; everything else is carried
/// by the envelope code.
#[must_use]
pub fn status_for(err: VerifyError) -> StatusCode {
    match err {
        VerifyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    }
}

#[must_use]
pub fn error_response(err: VerifyError) -> Response {
    error_response_with_query(err, None)
}

#[must_use]
pub fn error_response_with_query(err: VerifyError, query_id: Option<String>) -> Response {
    let body = ErrorResponse {
        code: err.code(),
        data: ErrorData {
            error: err.to_string(),
            query_id,
        },
    };
    (status_for(err), Json(body)).into_response()
}

/// Client address from proxy headers, `x-forwarded-for` first.
pub fn extract_client_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
