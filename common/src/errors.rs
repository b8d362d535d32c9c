// Error handling framework
// Not-found storage responses are data, not failures: callers normalise them
// to "absent" before they reach the polling loop.

use thiserror::Error;

/// Storage backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch for '{0}': not a block blob")]
    TypeMismatch(String),

    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl StorageError {
    /// Not-found and type-mismatch responses are treated as "absent" by callers
    pub fn is_absent(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::TypeMismatch(_))
    }
}

/// Periodic timer and command errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Invalid timer state: {0}")]
    InvalidState(String),

    #[error("Invalid argument '{argument}': {reason}")]
    InvalidArgument { argument: String, reason: String },
}

/// Blob path pattern errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid blob path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Missing closing bracket in pattern '{0}'")]
    MissingClosingBracket(String),

    #[error("No value for parameter '{parameter}' in pattern '{pattern}'")]
    UnboundParameter { pattern: String, parameter: String },
}

/// Trigger evaluation errors
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("Invocation of '{function}' failed: {reason}")]
    Invocation { function: String, reason: String },
}

/// Blob listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Registration for container '{0}' attempted after the listener started")]
    RegistrationAfterStart(String),

    #[error("Container '{container}' belongs to account '{actual}', listener serves '{expected}'")]
    AccountMismatch {
        container: String,
        expected: String,
        actual: String,
    },

    #[error("Listener has been disposed")]
    Disposed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("Polling cancelled")]
    Cancelled,
}

/// Causality envelope errors
#[derive(Error, Debug)]
pub enum CausalityError {
    #[error("Message is not a causality envelope: {0}")]
    NotAnEnvelope(String),

    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error(transparent)]
    Causality(#[from] CausalityError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_absent() {
        assert!(StorageError::NotFound("c/b".to_string()).is_absent());
        assert!(StorageError::TypeMismatch("c/b".to_string()).is_absent());
        assert!(!StorageError::Throttled("c/b".to_string()).is_absent());
        assert!(!StorageError::S3Error("500".to_string()).is_absent());
    }

    #[test]
    fn test_timer_error_display() {
        let err = TimerError::InvalidArgument {
            argument: "failure_speedup_divisor".to_string(),
            reason: "must not be less than 1".to_string(),
        };
        assert!(err.to_string().contains("failure_speedup_divisor"));
    }

    #[test]
    fn test_storage_error_converts_into_trigger_error() {
        let err: TriggerError = StorageError::Timeout("list".to_string()).into();
        assert!(matches!(err, TriggerError::Storage(StorageError::Timeout(_))));
    }

    #[test]
    fn test_registration_after_start_names_container() {
        let err = ListenerError::RegistrationAfterStart("input".to_string());
        assert!(err.to_string().contains("'input'"));
    }
}
