//! Registry error types
//!
//! Publish/subscribe conflicts reported to the command layer.

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Path already has a publisher
    AlreadyExists(String),
    /// Client already holds a subscription (to the given path)
    AlreadySubscribing(String),
    /// Nothing is published at the path
    StreamDoesntExist(String),
    /// Unpublish of a path that is not published
    NotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyExists(path) => {
                write!(f, "Stream already has a publisher: {}", path)
            }
            RegistryError::AlreadySubscribing(path) => {
                write!(f, "Client already subscribing to: {}", path)
            }
            RegistryError::StreamDoesntExist(path) => write!(f, "Stream doesn't exist: {}", path),
            RegistryError::NotFound(path) => write!(f, "Stream not found: {}", path),
        }
    }
}

impl std::error::Error for RegistryError {}
