use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::db::DatabaseError;

/// Error returned by every gateway operation.
///
/// The rendered message always starts with the kind name (`NotFoundError: ...`) because the RPC
/// surface carries nothing but a message string.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("AuthError: {0}")]
    Auth(#[from] AuthError),

    #[error("NotFoundError: {0}")]
    NotFound(String),

    #[error("NotFoundError: UnknownGenomeError: genome '{0}' is not in the catalog")]
    UnknownGenome(String),

    #[error("InvalidHandleError: {0}")]
    InvalidHandle(String),

    #[error("JobSubmissionError: {0}")]
    JobSubmission(String),

    #[error("IOError: {0}")]
    Io(String),

    #[error("ExternalToolError: {0}")]
    ExternalTool(String),
}

/// The error taxonomy shared by all RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    NotFound,
    InvalidHandle,
    JobSubmission,
    Io,
    ExternalTool,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "AuthError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::InvalidHandle => "InvalidHandleError",
            ErrorKind::JobSubmission => "JobSubmissionError",
            ErrorKind::Io => "IOError",
            ErrorKind::ExternalTool => "ExternalToolError",
        };
        f.write_str(name)
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Auth(_) => ErrorKind::Auth,
            GatewayError::NotFound(_) | GatewayError::UnknownGenome(_) => ErrorKind::NotFound,
            GatewayError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            GatewayError::JobSubmission(_) => ErrorKind::JobSubmission,
            GatewayError::Io(_) => ErrorKind::Io,
            GatewayError::ExternalTool(_) => ErrorKind::ExternalTool,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => GatewayError::NotFound(err.to_string()),
            other => GatewayError::Io(other.to_string()),
        }
    }
}

impl From<SchedulerError> for GatewayError {
    fn from(err: SchedulerError) -> Self {
        GatewayError::JobSubmission(err.to_string())
    }
}

/// Failures reported by an external store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Directory '{0}' is not empty")]
    DirectoryNotEmpty(String),

    #[error("I/O failure on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Classifies an I/O error raised while touching `path`.
    pub fn from_io(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(path.to_string()),
            _ => StoreError::Io {
                path: path.to_string(),
                source,
            },
        }
    }
}

/// Failures reported by an external scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler rejected job '{name}': {reason}")]
    Rejected { name: String, reason: String },

    #[error("Failed to launch job '{name}': {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("No config file found (set GENOGATE_CONFIG or pass a path)")]
    NotFound,
}

/// Failure to bring the gateway up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store root '{path}' is unusable: {source}")]
    StoreRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity provider setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Scheduler setup failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_kind_prefix() {
        let err = GatewayError::InvalidHandle("handle 1234 is closed".to_string());
        assert_eq!(err.to_string(), "InvalidHandleError: handle 1234 is closed");
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_unknown_genome_is_not_found_kind() {
        let err = GatewayError::UnknownGenome("mm9".to_string());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().starts_with("NotFoundError:"));
        assert!(err.to_string().contains("mm9"));
    }

    #[test]
    fn test_store_error_mapping() {
        let missing: GatewayError = StoreError::NotFound("/user/a/x".to_string()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let denied: GatewayError = StoreError::PermissionDenied("/etc".to_string()).into();
        assert_eq!(denied.kind(), ErrorKind::Io);

        let not_empty: GatewayError = StoreError::DirectoryNotEmpty("/d".to_string()).into();
        assert_eq!(not_empty.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_store_error_from_io_classifies() {
        let err = StoreError::from_io(
            "/a",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = StoreError::from_io(
            "/a",
            std::io::Error::new(std::io::ErrorKind::Other, "disk"),
        );
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_scheduler_error_is_submission_kind() {
        let err: GatewayError = SchedulerError::Unavailable("down".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::JobSubmission);
    }
}
