//! HTTP response building helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::SettlementError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": message }))
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed" }),
    )
}

/// Convert a SettlementError to an appropriate HTTP response
pub fn error_response(error: SettlementError) -> Response<Full<Bytes>> {
    let status = match &error {
        SettlementError::InvalidInput(_) | SettlementError::Json(_) => StatusCode::BAD_REQUEST,
        SettlementError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
        SettlementError::Conflict(_) | SettlementError::InvalidTransition(_) => StatusCode::CONFLICT,
        SettlementError::ExternalTransfer(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if error.is_rejection() {
        debug!(status = %status, error = %error, "Request rejected");
    } else {
        error!(status = %status, error = %error, "Request failed");
    }

    json_response(status, &serde_json::json!({ "error": error.to_string() }))
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, SettlementError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Returns 404 if None
pub fn from_option<T: Serialize>(
    result: Result<Option<T>, SettlementError>,
    not_found_msg: &str,
) -> Response<Full<Bytes>> {
    match result {
        Ok(Some(value)) => ok(&value),
        Ok(None) => not_found(not_found_msg),
        Err(e) => error_response(e),
    }
}

pub fn from_create_result<T: Serialize>(result: Result<T, SettlementError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}
