use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every stage and port.
///
/// Retry eligibility is a property of the kind, not of the call site:
/// `Throttled` is retried by the component that issued the directive,
/// `ServiceFault` only by the orchestration-level policy, and everything else
/// is surfaced immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AccessDenied,
    Throttled,
    ServiceFault,
    Timeout,
    ValidationMismatch,
    ObjectTooLarge,
    InvalidInput,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::Throttled => "Throttled",
            Self::ServiceFault => "ServiceFault",
            Self::Timeout => "Timeout",
            Self::ValidationMismatch => "ValidationMismatch",
            Self::ObjectTooLarge => "ObjectTooLarge",
            Self::InvalidInput => "InvalidInput",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn is_throttle_retryable(self) -> bool {
        matches!(self, Self::Throttled)
    }

    pub fn is_stage_retryable(self) -> bool {
        matches!(self, Self::ServiceFault)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every external capability (broker, stores, notifier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub operation: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn access_denied(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, operation, message)
    }

    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Throttled, operation, message)
    }

    pub fn service_fault(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceFault, operation, message)
    }
}

/// Maps a provider error code onto the taxonomy.
///
/// Unknown codes are treated as transient service faults so the stage-level
/// policy gets a chance to retry them.
pub fn classify_error_code(code: &str) -> ErrorKind {
    match code {
        "AccessDenied"
        | "AccessDeniedException"
        | "403"
        | "Forbidden"
        | "InvalidAccessKeyId"
        | "SignatureDoesNotMatch"
        | "ExpiredToken"
        | "AllAccessDisabled"
        | "KMS.AccessDeniedException"
        | "KMS.DisabledException" => ErrorKind::AccessDenied,
        "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
        | "TooManyRequestsException" | "503" => ErrorKind::Throttled,
        "NoSuchKey" | "NoSuchBucket" | "InvalidRequest" | "InvalidArgument" | "InvalidRange"
        | "EntityTooLarge" => ErrorKind::InvalidInput,
        "RequestTimeout" | "RequestTimeoutException" => ErrorKind::Timeout,
        _ => ErrorKind::ServiceFault,
    }
}
