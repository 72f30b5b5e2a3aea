use serde::Serialize;

/// Error category that crosses the API boundary. The HTTP server (an
/// external collaborator) maps these to status codes; the engine only
/// guarantees the category and a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    PreconditionFailed,
    ResourceExhausted,
    Conflict,
    Backend,
    Timeout,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Backend(_) | Self::CommandFailed { .. } => ErrorKind::Backend,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Wrap a backend failure with the operation context, keeping the cause
    /// text in the message chain for logs.
    pub fn backend_context(self, context: &str) -> EngineError {
        match self {
            Self::CommandFailed { exit_code, stderr } => {
                EngineError::Backend(format!("{context}: exit code {exit_code}: {stderr}"))
            }
            other => EngineError::Backend(format!("{context}: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::PreconditionFailed("x".into()).kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            EngineError::CommandFailed {
                exit_code: 1,
                stderr: "boom".into()
            }
            .kind(),
            ErrorKind::Backend
        );
        assert_eq!(
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "io")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_display() {
        let err = EngineError::CommandFailed {
            exit_code: 2,
            stderr: "dataset does not exist".into(),
        };
        assert_eq!(
            err.to_string(),
            "command failed with exit code 2: dataset does not exist"
        );

        let err = EngineError::NotFound("clone_abc".into());
        assert_eq!(err.to_string(), "not found: clone_abc");
    }

    #[test]
    fn test_backend_context() {
        let err = EngineError::CommandFailed {
            exit_code: 1,
            stderr: "no such pool".into(),
        };
        let wrapped = err.backend_context("zfs clone");
        assert_eq!(wrapped.kind(), ErrorKind::Backend);
        assert!(wrapped.to_string().contains("zfs clone"));
        assert!(wrapped.to_string().contains("no such pool"));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
    }
}
