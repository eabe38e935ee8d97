use std::io;
use thiserror::Error;

/// Central error type for startup, configuration and reactor-fatal failures.
///
/// Per-connection failures never surface as `WebservError`; they are turned
/// into a [`ResponseError`] and answered with an error page.
#[derive(Debug, Error)]
pub enum WebservError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file parsed but failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid TOML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Every configured address failed to bind.
    #[error("no listener could be bound")]
    NoListeners,

    /// The SIGINT/SIGTERM handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

pub type WebservResult<T> = Result<T, WebservError>;

/// A request-scoped failure that maps onto an HTTP status.
///
/// Raised by routing, the request handlers and CGI setup; the connection
/// converts it into the host's error page for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed with status {status}")]
pub struct ResponseError {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseError {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

impl From<io::Error> for ResponseError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ResponseError::new(404),
            io::ErrorKind::PermissionDenied => ResponseError::new(403),
            _ => ResponseError::new(500),
        }
    }
}
