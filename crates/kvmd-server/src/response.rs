//! JSON envelope helpers. Every API answer is
//! `{"ok": bool, "result": {...}}`; errors add `error`/`error_msg` inside
//! the result.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use kvmd_core::ApiError;

pub fn json_response<T: Serialize>(result: &T) -> Response {
    json_response_with_status(StatusCode::OK, &json!({
        "ok": true,
        "result": result,
    }))
}

pub fn json_error(err: &ApiError) -> Response {
    if matches!(err, ApiError::Internal(_)) {
        error!(error = %err, "API error");
    }
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response_with_status(status, &json!({
        "ok": false,
        "result": {
            "error": err.name(),
            "error_msg": err.to_string(),
        },
    }))
}

fn json_response_with_status(status: StatusCode, payload: &Value) -> Response {
    let body = serde_json::to_string_pretty(payload).expect("json render");
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// One NDJSON line with the standard envelope, `\r\n`-terminated.
pub fn ndjson_line<T: Serialize>(ok: bool, result: &T) -> String {
    let mut line = serde_json::to_string(&json!({
        "ok": ok,
        "result": result,
    }))
    .expect("json render");
    line.push_str("\r\n");
    line
}

pub fn ndjson_error_line(err: &ApiError) -> String {
    ndjson_line(false, &json!({
        "error": err.name(),
        "error_msg": err.to_string(),
    }))
}

/// Handler-level error wrapper so `?` on component errors lands in the
/// envelope format.
pub struct HttpError(pub ApiError);

impl<E: Into<ApiError>> From<E> for HttpError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        json_error(&self.0)
    }
}

pub type ApiResult = Result<Response, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let line = ndjson_line(true, &json!({"x": 1}));
        assert!(line.ends_with("\r\n"));
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["result"]["x"], 1);
    }

    #[test]
    fn error_statuses() {
        let response = json_error(&ApiError::Busy("busy".to_owned()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = json_error(&ApiError::Validator("bad".to_owned()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = json_error(&ApiError::Unauthorized);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
