use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("tool loop did not finish within {rounds} model rounds")]
    ToolLoopExceeded { rounds: usize },
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Failures reading or writing session files. Each cause is kept distinct so
/// callers can tell a missing file from a bad one.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("the file '{}' does not exist", path.display())]
    NotFound { path: PathBuf },
    #[error("no permission to access '{}'", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("encoding error in '{}': {reason}", path.display())]
    Encoding { path: PathBuf, reason: String },
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub(crate) fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::InvalidData => Self::Encoding {
                path,
                reason: err.to_string(),
            },
            _ => Self::Io { path, source: err },
        }
    }
}
