use thiserror::Error;

/// Coarse classification used by the retry policy to decide whether a
/// failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    ServerError,
    ClientError,
    RedirectLimit,
    Malformed,
    NoInfo,
}

/// Anything that can be sorted into an [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Failure while resolving a single token.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("too many redirects ({hops}) starting at {url}")]
    TooManyRedirects { url: String, hops: usize },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("page has no {0}")]
    MissingField(&'static str),
}

impl ResolveError {
    /// Map a transport error from reqwest onto our taxonomy.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ResolveError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_redirect() {
            ResolveError::TooManyRedirects {
                url: url.to_string(),
                hops: 0,
            }
        } else if err.is_builder() {
            ResolveError::InvalidUrl(format!("{}: {}", url, err))
        } else {
            ResolveError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl Classify for ResolveError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Timeout { .. } => ErrorKind::Timeout,
            ResolveError::Network { .. } => ErrorKind::Network,
            ResolveError::Status { status, .. } if *status >= 500 => ErrorKind::ServerError,
            ResolveError::Status { .. } => ErrorKind::ClientError,
            ResolveError::TooManyRedirects { .. } => ErrorKind::RedirectLimit,
            ResolveError::InvalidUrl(_) | ResolveError::Malformed(_) => ErrorKind::Malformed,
            ResolveError::MissingField(_) => ErrorKind::NoInfo,
        }
    }
}
