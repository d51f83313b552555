//! Shared error traits for consistent error reporting across crates

use std::fmt::Debug;

/// Category of error for consistent handling and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller input or configuration error - can be fixed by the caller
    User,
    /// File system or environment error
    System,
    /// Failure reported by the inference engine
    Engine,
    /// Internal logic error - indicates a bug
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::System => write!(f, "system"),
            ErrorCategory::Engine => write!(f, "engine"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Trait for all errors in the llama-completion workspace
///
/// Every error enum reports a category and a stable code so callers can branch
/// on the kind of failure without matching on message text. Nothing in this
/// workspace retries on its own; callers decide what to do with each category.
pub trait LlamaError: std::error::Error + Send + Sync + Debug {
    /// Get the error category for proper handling
    fn category(&self) -> ErrorCategory;

    /// Get a unique error code for this error type
    fn error_code(&self) -> &'static str;

    /// Check if this is a user-correctable error
    fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Get a user-friendly error message with actionable advice
    fn user_friendly_message(&self) -> String {
        let hint = match self.category() {
            ErrorCategory::User => "Check the request parameters and configuration",
            ErrorCategory::System => "Check file paths, permissions and free disk space",
            ErrorCategory::Engine => "The inference engine rejected the operation",
            ErrorCategory::Internal => "This is a bug, please report it",
        };
        format!("{}\n💡 {}", self, hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum ProbeError {
        #[error("bad temperature")]
        BadTemperature,
        #[error("disk full")]
        DiskFull,
    }

    impl LlamaError for ProbeError {
        fn category(&self) -> ErrorCategory {
            match self {
                ProbeError::BadTemperature => ErrorCategory::User,
                ProbeError::DiskFull => ErrorCategory::System,
            }
        }

        fn error_code(&self) -> &'static str {
            match self {
                ProbeError::BadTemperature => "PROBE_TEMPERATURE",
                ProbeError::DiskFull => "PROBE_DISK",
            }
        }
    }

    #[test]
    fn test_user_error_detection() {
        assert!(ProbeError::BadTemperature.is_user_error());
        assert!(!ProbeError::DiskFull.is_user_error());
    }

    #[test]
    fn test_friendly_message_carries_hint() {
        let message = ProbeError::DiskFull.user_friendly_message();
        assert!(message.starts_with("disk full"));
        assert!(message.contains("💡"));
        assert!(message.contains("disk space"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Engine.to_string(), "engine");
        assert_eq!(ProbeError::BadTemperature.error_code(), "PROBE_TEMPERATURE");
    }
}
