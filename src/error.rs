use std::sync::Arc;

/// Result type used throughout the crate.
///
/// This is a standard Rust `Result` where the error variant is the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the synchronization
/// core.
///
/// Note that a malformed individual split is *not* represented here:
/// per-entity parse failures are absorbed at the wire layer (see
/// [`crate::splits::TryParse`]) so one bad entity never fails a whole batch.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// An I/O error, such as a task thread failing to spawn.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error. Transient by contract: sync tasks log it and retry on
    /// the next cycle.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn io_errors_convert_to_the_io_variant() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "spawn failed").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
