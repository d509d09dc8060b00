use std::io;

use thiserror::Error;

/// Errors surfaced by the library.
///
/// Reporter implementations convert transport failures into log entries at
/// the reporting boundary; `Error` values escape only from construction and
/// configuration paths, and from registry iteration when a visitor bails
/// out early.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying socket or file I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP transport failure while talking to a sink backend.
    #[error("http error: {0}")]
    Http(String),

    /// A sink rejected a report payload.
    #[error("report failed: {0}")]
    Report(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        Error::Http(e.to_string())
    }
}
