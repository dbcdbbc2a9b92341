use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lh_protocol::HttpErrorEnvelope;
use std::fmt::Display;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        err.to_string(),
    )
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

pub fn payload_too_large(message: impl Into<String>) -> Response {
    json_error(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", message)
}

pub fn too_many_requests(message: impl Into<String>) -> Response {
    json_error(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
}

pub fn unprocessable(message: impl Into<String>) -> Response {
    json_error(
        StatusCode::UNPROCESSABLE_ENTITY,
        "NO_SUITABLE_SCHEMA",
        message,
    )
}

pub fn service_unavailable(message: impl Into<String>) -> Response {
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "SERVICE_UNAVAILABLE",
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_code: &str,
    ) {
        assert_eq!(response.status(), expected_status);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: HttpErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");
        assert_eq!(parsed.code, expected_code);
        assert_eq!(parsed.details, None);
    }

    #[tokio::test]
    async fn error_constructors_set_status_and_code() {
        assert_error_response(bad_request("x"), StatusCode::BAD_REQUEST, "BAD_REQUEST").await;
        assert_error_response(not_found("x"), StatusCode::NOT_FOUND, "NOT_FOUND").await;
        assert_error_response(unauthorized("x"), StatusCode::UNAUTHORIZED, "UNAUTHORIZED").await;
        assert_error_response(
            payload_too_large("x"),
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
        )
        .await;
        assert_error_response(
            too_many_requests("x"),
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
        )
        .await;
        assert_error_response(
            unprocessable("x"),
            StatusCode::UNPROCESSABLE_ENTITY,
            "NO_SUITABLE_SCHEMA",
        )
        .await;
        assert_error_response(
            service_unavailable("x"),
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
        )
        .await;
        assert_error_response(
            internal_error("boom"),
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
        )
        .await;
    }
}
