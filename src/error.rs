//! Error types shared across the loader, the cache stores and the classifier.

/// A failure of one remote call (transport, auth or non-200 status).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote returned status {status}: {code}")]
    Status { status: u16, code: String },

    #[error("authorization failed: {0}")]
    Auth(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors that abort `PagedEntityLoader::load`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch {entity}: {source}")]
    RemoteFetch {
        entity: String,
        #[source]
        source: FetchError,
    },

    #[error("malformed response for {entity}: {reason}")]
    MalformedResponse { entity: String, reason: String },

    #[error("invalid query parameters: {0}")]
    InvalidParams(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// A lesson row whose nested attendance data could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed attendance data: {0}")]
pub struct MalformedAttendanceError(pub String);
