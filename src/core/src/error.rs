use thiserror::Error;

/// nydus-commit error types
#[derive(Error, Debug)]
pub enum CommitError {
    /// Configuration file missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container address did not parse as `engine://id`
    #[error("Invalid container address: {0}")]
    InvalidContainerAddress(String),

    /// Engine inspect endpoint failed or returned unusable data
    #[error("Inspect error: {0}")]
    Inspect(String),

    /// Image reference failed to parse or is digest-pinned
    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),

    /// The container's image is not in the accelerated (nydus) format
    #[error("Not a nydus image: {0}")]
    NotAnAcceleratedImage(String),

    /// The base image's commit chain reached the configured ceiling
    #[error("Reached maximum committed times {0}")]
    MaximumCommitsReached(usize),

    /// Overlay diff traversal failed
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The external builder subprocess failed
    #[error("Pack error: {0}")]
    Pack(String),

    /// Entering the container's mount namespace failed
    #[error("Namespace entry error: {0}")]
    NamespaceEntry(String),

    /// Blob, config or bootstrap publication failed
    #[error("Push error: {0}")]
    Push(String),

    /// Fetching the base image's manifest, config or bootstrap failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Bootstrap merge failed
    #[error("Merge error: {0}")]
    Merge(String),

    /// Manifest assembly or publication failed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The commit was cancelled by the caller
    #[error("Commit cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CommitError {
    fn from(err: serde_json::Error) -> Self {
        CommitError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CommitError {
    fn from(err: serde_yaml::Error) -> Self {
        CommitError::Serialization(err.to_string())
    }
}

/// Result type alias for nydus-commit operations
pub type Result<T> = std::result::Result<T, CommitError>;
