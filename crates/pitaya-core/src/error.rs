use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("OS call failed: {0}")]
    TransientOsFailure(String),

    #[error("{operation} timed out after {}ms", .limit.as_millis())]
    Timeout { operation: String, limit: Duration },

    #[error("Process enumeration failed: {0}")]
    Enumeration(String),

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-operation failure classes folded into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    PermissionDenied,
    UnsupportedFeature,
    TransientOsFailure,
    Timeout,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not found",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::UnsupportedFeature => "unsupported feature",
            FailureKind::TransientOsFailure => "OS call failed",
            FailureKind::Timeout => "timed out",
        }
    }
}

impl Error {
    /// Taxonomy class of this error. Everything that is not one of the
    /// per-operation classes counts as a transient OS failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NotFound(_) => FailureKind::NotFound,
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::UnsupportedFeature(_) => FailureKind::UnsupportedFeature,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                FailureKind::PermissionDenied
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => FailureKind::NotFound,
            _ => FailureKind::TransientOsFailure,
        }
    }

    /// Message without the variant prefix, for report lines.
    pub fn reason(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::PermissionDenied(m)
            | Error::UnsupportedFeature(m)
            | Error::TransientOsFailure(m)
            | Error::Enumeration(m)
            | Error::Busy(m)
            | Error::Pattern(m)
            | Error::Config(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_display() {
        let err = Error::PermissionDenied("SetPriorityClass on PID 42".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("PID 42"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            operation: "set cpu affinity".to_string(),
            limit: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "set cpu affinity timed out after 1500ms");
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NotFound("x".into()).kind(), FailureKind::NotFound);
        assert_eq!(
            Error::UnsupportedFeature("x".into()).kind(),
            FailureKind::UnsupportedFeature
        );
        assert_eq!(
            Error::Enumeration("x".into()).kind(),
            FailureKind::TransientOsFailure
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access is denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), FailureKind::PermissionDenied);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_reason_strips_prefix() {
        let err = Error::Busy("restriction run in progress".to_string());
        assert_eq!(err.reason(), "restriction run in progress");
        assert!(err.to_string().starts_with("Engine busy"));
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission_denied\"");
    }
}
