use reqwest::StatusCode;
use thiserror::Error;

/// Error classes the backfill driver branches on.
///
/// The sweep outlives individual bucket failures: transient and schema faults
/// are logged and the sweep moves on to the next bucket, while authentication
/// and local write faults abort the whole run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("the API answered {0}")]
    Status(StatusCode),

    #[error("unexpected response shape: {0}")]
    Schema(String),

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

impl From<csv::Error> for DownloadError {
    fn from(error: csv::Error) -> Self {
        match error.into_kind() {
            csv::ErrorKind::Io(error) => Self::Write(error),
            other => Self::Write(std::io::Error::other(format!("{other:?}"))),
        }
    }
}

impl DownloadError {
    /// Worth another attempt: network faults, throttling, and server errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Auth(_) | Self::Schema(_) | Self::Write(_) => false,
        }
    }

    /// Aborts the run: without a valid token or intact local output there is
    /// nothing useful left to do.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Write(_))
    }
}
