//! # Core Error Types
//!
//! Typed errors for the pure message model: validation failures surfaced
//! before a message ever enters a queue, queue capacity violations, and
//! illegal storage object state transitions.

use thiserror::Error;

/// Result type alias for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Validation Errors
// =============================================================================

/// A message failed validation and was never enqueued.
///
/// ## Design Principles
/// - Each variant names the offending field so callers can fix the input
/// - Raised synchronously by builders and by `Message::validate`
/// - A message that fails validation never enters any tracked state
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A mandatory field is missing.
    #[error("Missing required field: {field}")]
    Required { field: String },

    /// A key name exceeded the UTF-8 byte limit.
    #[error("Key '{key}' is {actual} bytes, limit is {max}")]
    KeyTooLong { key: String, actual: usize, max: usize },

    /// A string value exceeded the UTF-8 byte limit.
    #[error("Value for '{key}' is {actual} bytes, limit is {max}")]
    ValueTooLong { key: String, actual: usize, max: usize },

    /// A field was given a value of the wrong type.
    #[error("Field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A field value failed a format check.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A set-once field was assigned twice.
    #[error("Field '{field}' may only be set once")]
    AlreadySet { field: String },

    /// No such field in the schema.
    #[error("Unknown field: {field}")]
    UnknownField { field: String },
}

// =============================================================================
// Queue Errors
// =============================================================================

/// Errors raised by the bounded priority queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue already holds its configured maximum.
    #[error("Queue capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },
}

// =============================================================================
// State Errors
// =============================================================================

/// An operation was attempted against a storage object in the wrong state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Illegal state: {operation} not allowed while {state}")]
pub struct StateError {
    /// The operation that was rejected.
    pub operation: &'static str,
    /// The state the object was in.
    pub state: String,
}

impl StateError {
    pub fn new(operation: &'static str, state: impl Into<String>) -> Self {
        StateError {
            operation,
            state: state.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::KeyTooLong {
            key: "metric".into(),
            actual: 4000,
            max: 2048,
        };
        assert!(err.to_string().contains("metric"));
        assert!(err.to_string().contains("2048"));

        let err = QueueError::CapacityExceeded { capacity: 1000 };
        assert!(err.to_string().contains("1000"));

        let err = StateError::new("queue", "IN_PROGRESS");
        assert!(err.to_string().contains("IN_PROGRESS"));
    }
}
