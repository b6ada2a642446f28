use std::sync::Arc;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while working with project configuration or the sticky store.
///
/// None of these ever cross the decision boundary: [`DecisionEngine`](crate::DecisionEngine)
/// always answers with a variation or `None`. They are only returned from the APIs that
/// explicitly opt into strictness (e.g., [`StickyStore::save_durable`](crate::StickyStore::save_durable)).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A required identifier was empty.
    #[error("invalid argument: {0} must not be empty")]
    InvalidArgument(&'static str),

    /// Persisted or provided JSON could not be parsed.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Json(Arc<serde_json::Error>),

    /// An I/O error from the durable storage.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// The sticky store keeps records in memory only, either because durable storage couldn't be
    /// read on start or because the writer thread couldn't be started.
    #[error("sticky store is not persisting records")]
    PersistenceDisabled,

    /// The background writer is no longer accepting requests.
    #[error("sticky store writer has stopped")]
    WriterStopped,

    /// The background writer thread panicked. This should normally never happen.
    #[error("sticky store writer thread panicked")]
    WriterPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}
