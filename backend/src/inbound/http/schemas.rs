//! Shared OpenAPI schema types.

use serde::Serialize;
use utoipa::ToSchema;

/// Error payload returned by every endpoint on failure.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorSchema {
    /// Stable machine-readable error kind.
    #[schema(example = "insufficient_credits")]
    pub kind: String,
    /// Human-readable message.
    #[schema(example = "active balance cannot cover this synthesis")]
    pub message: String,
    /// Optional structured details, e.g. `{"required": 3, "available": 1}`.
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
}
