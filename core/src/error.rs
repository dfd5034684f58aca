use thiserror::Error;

/// Boxed provider error carried by [`Error::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The object does not exist on the remote side. Expected and benign.
    /// `key` is the key the caller passed, without the backend path prefix.
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Another operation is already in progress, {operation} rejected")]
    LockContention { operation: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("{kind} connection failed: {message}")]
    Connection { kind: &'static str, message: String },

    #[error("Transfer of {key} failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} request timeout after {after_ms}ms")]
    Timeout { kind: &'static str, after_ms: u64 },

    #[error("{kind} error: {source}")]
    Backend {
        kind: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{0} is not supported by this engine")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    pub fn backend<E>(kind: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Backend {
            kind,
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
