//! Error taxonomy shared by registration and discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid construction input (client, meta, conf, identity).
    #[error("configuration error: {0}")]
    Config(String),

    /// No appId owns the requested method.
    #[error("service method not found: {0}")]
    MethodNotFound(String),

    /// The owning appId has no live nodes.
    #[error("service node not found: {0}")]
    NodeNotFound(String),

    /// The node does not serve the requested method.
    #[error("node does not serve method: {0}")]
    NodeMethodNotFound(String),

    /// Network blip, renewal failure or write conflict against a backend.
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// A stored entry could not be turned into a valid node.
    #[error("malformed entry: {0}")]
    DataIntegrity(String),

    /// Lease recovery failed `attempts` times in a row.
    #[error("lease recovery exhausted after {attempts} attempts")]
    ExhaustedRetry { attempts: u32 },

    /// The session was uninstalled and can no longer publish.
    #[error("registration session is closed")]
    SessionClosed,

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a backend error tagged with the backend name.
    pub fn backend<S: ToString>(backend: &'static str, msg: S) -> Self {
        Self::Backend {
            backend,
            message: msg.to_string(),
        }
    }

    /// Create a data integrity error.
    pub fn data_integrity<S: Into<String>>(msg: S) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// Whether the error is a lookup miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::MethodNotFound(_) | Error::NodeNotFound(_) | Error::NodeMethodNotFound(_)
        )
    }
}
