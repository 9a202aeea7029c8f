//! # Client Error Types
//!
//! Error taxonomy for the dispatch engine.
//!
//! ## Error Surfaces
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Where Errors Surface                                │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌─────────────────────┐   │
//! │  │  Synchronous     │  │  Asynchronous    │  │  Recovered locally  │   │
//! │  │  (queue caller)  │  │  (onError batch) │  │                     │   │
//! │  │                  │  │                  │  │                     │   │
//! │  │  InvalidMessage  │  │  Transport       │  │  First 401 of a     │   │
//! │  │  CapacityExceeded│  │  ContentSync-    │  │  batch → refresh +  │   │
//! │  │  IllegalState    │  │    Failed        │  │  one retry;         │   │
//! │  │  InvalidConfig   │  │  AuthExpired     │  │  AuthExpired only   │   │
//! │  │                  │  │  (refresh broke) │  │  if refresh fails   │   │
//! │  └──────────────────┘  └──────────────────┘  └─────────────────────┘   │
//! │                                                                         │
//! │  No message is silently lost: every dropped message appears in         │
//! │  exactly one onError batch, except messages that never validated.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use uuid::Uuid;

use cloudlink_core::{QueueError, StateError, ValidationError};

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Transport Error
// =============================================================================

/// Failure reported by the send/receive collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Transport error{}: {message}", status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct TransportError {
    /// HTTP status, when the failure came back as a response.
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        TransportError {
            status,
            message: message.into(),
        }
    }

    /// True for 401-class failures that warrant one credential refresh and
    /// one retry of the same batch.
    pub fn is_auth_expired(&self) -> bool {
        self.status == Some(401)
    }
}

// =============================================================================
// Client Error
// =============================================================================

/// Client error covering every dispatch-layer failure.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    // =========================================================================
    // Validation & Capacity (synchronous)
    // =========================================================================
    /// The message failed validation and was never enqueued.
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),

    /// The outbound queue is full.
    #[error("Queue capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    /// Storage object misuse (queueing an active transfer, mutating a
    /// queued object).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // =========================================================================
    // Transport & Auth (asynchronous, via onError)
    // =========================================================================
    /// Network/HTTP failure reported with the batch that did not go out.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Credential refresh itself failed after a 401-class response.
    #[error("Authentication expired and refresh failed: {0}")]
    AuthExpired(String),

    /// A storage dependency failed; the dependent message is dropped and
    /// never retried.
    #[error("Content sync failed for message {client_id}")]
    ContentSyncFailed { client_id: Uuid },

    // =========================================================================
    // Configuration & Plumbing
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A control channel closed unexpectedly.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The dispatcher is shutting down.
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<QueueError> for ClientError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CapacityExceeded { capacity } => ClientError::CapacityExceeded { capacity },
        }
    }
}

impl From<StateError> for ClientError {
    fn from(err: StateError) -> Self {
        ClientError::IllegalState(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidConfig(format!("Invalid URL: {}", err))
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::InvalidConfig(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl ClientError {
    /// True for errors surfaced synchronously to the `queue()` caller.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidMessage(_)
                | ClientError::CapacityExceeded { .. }
                | ClientError::IllegalState(_)
                | ClientError::InvalidConfig(_)
        )
    }

    /// True when the failure came from the wire rather than the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::AuthExpired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        assert!(TransportError::new(Some(401), "expired").is_auth_expired());
        assert!(!TransportError::new(Some(500), "boom").is_auth_expired());
        assert!(!TransportError::new(None, "connection reset").is_auth_expired());
    }

    #[test]
    fn test_queue_error_conversion() {
        let err: ClientError = QueueError::CapacityExceeded { capacity: 1000 }.into();
        assert!(matches!(err, ClientError::CapacityExceeded { capacity: 1000 }));
        assert!(err.is_synchronous());
    }

    #[test]
    fn test_transport_display_includes_status() {
        let err = TransportError::new(Some(503), "unavailable");
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("unavailable"));
    }
}
