use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
}

/// Failure to resolve a key against a cache.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lookup: {0}")]
    Key(#[from] KeyError),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Other(String),
}
