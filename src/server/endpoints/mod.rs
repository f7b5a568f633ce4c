pub(crate) mod download;
pub(crate) mod netflix;
pub(crate) mod ping;
pub(crate) mod upload;
pub(crate) mod warmup;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::error::LimitError;

/// Admission refusals all surface the same way: 429 plus a human-readable
/// reason. Never retried server-side.
pub(crate) fn refusal(err: &LimitError) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
