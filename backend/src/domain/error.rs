//! Domain error representation shared across adapters.
//!
//! Keep this module free from HTTP or framework concerns so the same error
//! shape can be mapped by any adapter (HTTP, background workers).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

/// Stable machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The request is malformed or fails validation.
    InvalidRequest,
    /// Authentication failed or is missing.
    Unauthorized,
    /// Authenticated but not permitted to perform this action.
    Forbidden,
    /// The requested resource does not exist.
    NotFound,
    /// The request conflicts with current resource state.
    Conflict,
    /// The caller's active credit balance cannot cover the operation.
    InsufficientCredits,
    /// A downstream dependency is temporarily unavailable.
    ServiceUnavailable,
    /// An unexpected error occurred on the server.
    InternalError,
}

/// Domain error payload consumed by adapters.
///
/// # Examples
/// ```
/// use backend::domain::{Error, ErrorCode};
///
/// let err = Error::not_found("missing");
/// assert_eq!(err.code(), ErrorCode::NotFound);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, ThisError)]
#[serde(rename_all = "snake_case")]
#[error("{message}")]
pub struct Error {
    #[serde(rename = "kind")]
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl Error {
    /// Create a new error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message returned to clients.
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Supplementary structured details for clients.
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Attach structured details to the error.
    ///
    /// ```
    /// use backend::domain::Error;
    /// use serde_json::json;
    ///
    /// let err = Error::invalid_request("bad").with_details(json!({ "field": "amount" }));
    /// assert!(err.details().is_some());
    /// ```
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn insufficient_credits(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientCredits, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Redact server-side details so the payload is safe to expose to clients.
    ///
    /// Internal errors keep their code but replace the message with a generic
    /// explanation and drop structured details.
    pub fn redacted_for_clients(&self) -> Self {
        if !matches!(self.code, ErrorCode::InternalError) {
            return self.clone();
        }
        Self {
            code: self.code,
            message: "Internal server error".to_string(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::invalid(Error::invalid_request("x"), ErrorCode::InvalidRequest)]
    #[case::unauthorized(Error::unauthorized("x"), ErrorCode::Unauthorized)]
    #[case::forbidden(Error::forbidden("x"), ErrorCode::Forbidden)]
    #[case::not_found(Error::not_found("x"), ErrorCode::NotFound)]
    #[case::conflict(Error::conflict("x"), ErrorCode::Conflict)]
    #[case::credits(Error::insufficient_credits("x"), ErrorCode::InsufficientCredits)]
    #[case::unavailable(Error::service_unavailable("x"), ErrorCode::ServiceUnavailable)]
    #[case::internal(Error::internal("x"), ErrorCode::InternalError)]
    fn constructors_set_expected_codes(#[case] err: Error, #[case] expected: ErrorCode) {
        assert_eq!(err.code(), expected);
    }

    #[rstest]
    fn internal_errors_are_redacted() {
        let err = Error::internal("pool exhausted on pg-3").with_details(json!({ "host": "pg-3" }));
        let redacted = err.redacted_for_clients();

        assert_eq!(redacted.message(), "Internal server error");
        assert!(redacted.details().is_none());
    }

    #[rstest]
    fn non_internal_errors_keep_their_message() {
        let err = Error::conflict("voice unavailable");
        assert_eq!(err.redacted_for_clients().message(), "voice unavailable");
    }

    #[rstest]
    fn serializes_code_as_kind() {
        let value = serde_json::to_value(Error::not_found("missing")).expect("serialize");
        assert_eq!(value["kind"], "not_found");
        assert_eq!(value["message"], "missing");
    }
}
