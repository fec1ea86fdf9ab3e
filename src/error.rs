use std::io;

use thiserror::Error;

/// Errors that can occur while serving a proxy request.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid blob reference: {0}")]
    InvalidReference(String),

    #[error("blob store unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("unknown blob type: {0}")]
    UnknownBlobType(String),

    #[error("no files in request")]
    NoFilesInRequest,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authorization required")]
    Unauthorized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("schema error: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("mime cache error: {0}")]
    MimeCache(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status code the error is surfaced as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidReference(_) => 400,
            Error::BadRequest(_) => 400,
            Error::Unauthorized => 401,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::InvalidReference(String::from("x")).status_code(), 400);
        assert_eq!(Error::BadRequest(String::from("x")).status_code(), 400);
        assert_eq!(Error::Unauthorized.status_code(), 401);
        assert_eq!(Error::NoFilesInRequest.status_code(), 500);
        assert_eq!(Error::UpstreamUnavailable(String::from("x")).status_code(), 500);
        assert_eq!(Error::Config(String::from("x")).status_code(), 500);
    }
}
