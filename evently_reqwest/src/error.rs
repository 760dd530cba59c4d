use reqwest::StatusCode;
use thiserror::Error;

use crate::SessionCancelled;

/// A failed API call
#[derive(Debug, Error)]
pub enum ApiError {
    /// No response arrived before the pipeline's timeout
    #[error("request timed out")]
    Timeout(#[source] reqwest_middleware::Error),
    /// The request could not be sent or its response could not be read
    #[error("network error")]
    Network(#[source] reqwest_middleware::Error),
    /// The server answered with a non-success status
    #[error("server rejected request with status {status}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The response body, empty if it could not be read
        body: String,
    },
    /// The session could not be renewed, so the request was never sent
    #[error(transparent)]
    SessionExpired(#[from] SessionCancelled),
    /// The response body did not match the expected shape
    #[error("unable to decode response body")]
    Decode(#[source] serde_json::Error),
    /// The request body could not be serialized
    #[error("unable to encode request body")]
    Encode(#[source] serde_json::Error),
    /// The path could not be resolved against the API's base URL
    #[error("invalid API path {path:?}")]
    InvalidPath {
        /// The path as given
        path: String,
        /// The resolution failure
        #[source]
        source: url::ParseError,
    },
}

impl ApiError {
    /// Whether the failure plausibly happened without any response from the server
    ///
    /// Only these failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    /// The status the server answered with, if it answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest_middleware::Error> for ApiError {
    fn from(error: reqwest_middleware::Error) -> Self {
        match error {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => {
                Self::Timeout(reqwest_middleware::Error::Reqwest(inner))
            }
            reqwest_middleware::Error::Middleware(inner) => {
                match inner.downcast::<SessionCancelled>() {
                    Ok(cancelled) => Self::SessionExpired(cancelled),
                    Err(other) => Self::Network(reqwest_middleware::Error::Middleware(other)),
                }
            }
            other => Self::Network(other),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        reqwest_middleware::Error::Reqwest(error).into()
    }
}

#[cfg(test)]
mod tests {
    use evently_session::SessionError;

    use super::*;

    #[test]
    fn server_rejections_are_not_transient() {
        let error = ApiError::Rejected {
            status: StatusCode::NOT_FOUND,
            body: "no such event".to_owned(),
        };

        assert!(!error.is_transient());
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn cancelled_session_is_recovered_from_middleware_error() {
        let error = ApiError::from(reqwest_middleware::Error::middleware(
            SessionCancelled::new(SessionError::NoRefreshToken),
        ));

        assert!(matches!(error, ApiError::SessionExpired(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn unknown_middleware_failure_counts_as_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let error = ApiError::from(reqwest_middleware::Error::middleware(io));

        assert!(matches!(error, ApiError::Network(_)));
        assert!(error.is_transient());
    }
}
