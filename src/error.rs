//! Error types for the service request core.

use thiserror::Error;

use crate::domain::business::BusinessId;
use crate::domain::request::{RequestId, RequestStatus};

/// Result type alias using the handyman error type.
pub type Result<T> = std::result::Result<T, HandymanError>;

/// Main error type for the service request core.
#[derive(Error, Debug)]
pub enum HandymanError {
    /// Missing or malformed input, or a stored document that fails to decode.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested status change is not an edge of the lifecycle.
    #[error("Invalid transition: '{from}' cannot move to '{to}'")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Business not found
    #[error("Business not found: {0}")]
    BusinessNotFound(BusinessId),

    /// The actor is not the party allowed to perform this action.
    #[error("Actor '{actor}' may not {action}")]
    Forbidden { actor: String, action: String },

    /// The backing store could not be reached or timed out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A precondition of an atomic write no longer held; re-read and retry.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// HTTP client error (notification webhooks)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandymanError {
    /// Whether the caller may retry the same operation (after re-reading, for conflicts).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandymanError::StoreUnavailable(_) | HandymanError::TransactionConflict(_)
        )
    }

    /// Whether the referenced record is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HandymanError::RequestNotFound(_) | HandymanError::BusinessNotFound(_)
        )
    }

    /// Short message suitable for showing to the party that initiated the action.
    pub fn user_message(&self) -> String {
        match self {
            HandymanError::Validation(msg) => format!("Please check your input: {}", msg),
            HandymanError::InvalidTransition { from, to } => format!(
                "This request is '{}' and can no longer be marked '{}'.",
                from, to
            ),
            HandymanError::RequestNotFound(_) => "This request no longer exists.".to_string(),
            HandymanError::BusinessNotFound(_) => "This business no longer exists.".to_string(),
            HandymanError::Forbidden { .. } => {
                "You are not allowed to perform this action.".to_string()
            }
            HandymanError::StoreUnavailable(_) | HandymanError::TransactionConflict(_) => {
                "The service is busy or unreachable. Please try again.".to_string()
            }
            HandymanError::Http(_) | HandymanError::Serialization(_) | HandymanError::Other(_) => {
                "An unexpected error occurred.".to_string()
            }
        }
    }
}
