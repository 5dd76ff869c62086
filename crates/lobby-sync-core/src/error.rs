use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used to decide how a failed fetch is treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// The resource does not exist (or no longer exists) on the service.
    NotFound,
    /// Network failure, request timeout or non-2xx response.
    Transport,
    /// The service answered but the payload could not be decoded.
    MalformedResponse,
    /// Invalid input or an operation that is not possible in the current state.
    Config,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload returned by collaborators and refresh operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The resource with `id` is not present on the service.
    pub fn not_found(id: &str) -> Self {
        Self::new(
            SyncErrorCategory::NotFound,
            "resource_not_found",
            format!("resource not found: {id}"),
        )
    }

    /// Generic transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Transport, "transport_error", message)
    }

    /// Map an HTTP status returned by the service to an error.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let category = classify_http_status(status);
        let code = match category {
            SyncErrorCategory::NotFound => "resource_not_found",
            _ => "http_error",
        };
        Self::new(category, code, format!("HTTP {status}: {}", message.into()))
    }

    /// Wrap a payload decoding failure.
    pub fn from_json(err: serde_json::Error) -> Self {
        Self::new(
            SyncErrorCategory::MalformedResponse,
            "malformed_response",
            err.to_string(),
        )
    }

    /// Operation requires a tracked resource but none is tracked.
    pub fn not_tracking(action: &str) -> Self {
        Self::new(
            SyncErrorCategory::Config,
            "not_tracking",
            format!("cannot run '{action}' without a tracked resource"),
        )
    }

    /// Whether the error means "the resource is absent" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        self.category == SyncErrorCategory::NotFound
    }

    /// Whether retrying on a later tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Transport | SyncErrorCategory::MalformedResponse
        )
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        404 | 410 => SyncErrorCategory::NotFound,
        400..=599 => SyncErrorCategory::Transport,
        _ => SyncErrorCategory::Internal,
    }
}
