use thiserror::Error;

/// Errors surfaced by the telemetry storage layer.
///
/// Only `NotFound` is expected to reach end users (as a 404-equivalent).
/// `Storage` failures are caught at the [`Recorder::store`] boundary and
/// swallowed so a storage outage never aborts the host operation.
///
/// [`Recorder::store`]: crate::recorder::Recorder::store
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup by id found no matching entry.
    #[error("no telemetry entry with id {0}")]
    NotFound(String),

    /// Any I/O failure while storing, querying, monitoring or pruning.
    #[error("storage failure: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Invalid combination of query options. Readers fall back to a
    /// degraded default listing instead of surfacing this where possible.
    #[error("malformed query: {0}")]
    MalformedQuery(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("unknown".to_string()),
            other => Self::Storage(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(Box::new(err))
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Self::Storage(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = Error::NotFound("abc-123".to_string());
        assert_eq!(error.to_string(), "no telemetry entry with id abc-123");
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let error: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(error, Error::NotFound(_)));
    }
}
