//! HTTP adapter mapping for domain errors.
//!
//! Keeps the domain error type HTTP-agnostic while letting Actix handlers
//! turn domain failures into consistent JSON responses and status codes.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use tracing::error;

use crate::domain::{Error, ErrorCode};

/// Convenient result alias for HTTP handlers.
pub type ApiResult<T> = Result<T, Error>;

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
        ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        status_for(self.code())
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.redacted_for_clients())
    }
}

impl From<actix_web::Error> for Error {
    fn from(err: actix_web::Error) -> Self {
        // Do not leak implementation details to clients.
        error!(error = %err, "actix error promoted to domain error");
        Error::internal("Internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorCode::InvalidRequest, 400)]
    #[case(ErrorCode::Unauthorized, 401)]
    #[case(ErrorCode::InsufficientCredits, 402)]
    #[case(ErrorCode::Forbidden, 403)]
    #[case(ErrorCode::NotFound, 404)]
    #[case(ErrorCode::Conflict, 409)]
    #[case(ErrorCode::ServiceUnavailable, 503)]
    #[case(ErrorCode::InternalError, 500)]
    fn codes_map_to_expected_statuses(#[case] code: ErrorCode, #[case] status: u16) {
        assert_eq!(status_for(code).as_u16(), status);
    }

    #[rstest]
    fn internal_responses_are_redacted() {
        let response = Error::internal("pg password leaked").error_response();
        assert_eq!(response.status().as_u16(), 500);
    }
}
