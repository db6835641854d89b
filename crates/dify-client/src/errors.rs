use crate::aggregate::StreamResult;

/// Error body returned by the platform for a failed HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// HTTP status code of the failed response.
    pub status_code: u16,
    /// Human-readable message (`API request failed: <status> - <detail>`).
    pub message: String,
    /// Parsed JSON error body when the response carried one.
    pub error_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.status_code, self.message)
    }
}

/// Top-level error type for the public client API.
///
/// Transport failures travel through this type. In-band `error` events of a
/// stream do not; they are recorded in [`StreamResult::error`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DifyError {
    /// 401: the API key was rejected.
    #[error("auth error: {0}")]
    Auth(ApiError),
    /// Any other 4xx. Never retried.
    #[error("request error: {0}")]
    Request(ApiError),
    /// 429 after retries were exhausted.
    #[error("rate limited: {0}")]
    RateLimit(ApiError),
    /// 5xx after retries were exhausted.
    #[error("server error: {0}")]
    Server(ApiError),
    /// Request timed out after retries were exhausted.
    #[error("timeout: {message}")]
    Timeout { message: String },
    /// DNS, TLS or connect failure after retries were exhausted.
    #[error("connection error: {message}")]
    Connection { message: String },
    /// Reading an already-open body failed.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// The stream died after some events were already dispatched.
    #[error("stream interrupted: {message}")]
    StreamInterrupted {
        message: String,
        /// The body read hit the idle timeout.
        timed_out: bool,
        partial: Box<StreamResult>,
    },
    /// Malformed SSE frame, surfaced only in strict decode mode.
    #[error("decode error: {message}")]
    Decode { message: String },
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Local file access failed.
    #[error("io error: {0}")]
    Io(String),
}

impl DifyError {
    /// HTTP status code when the failure came from a response.
    pub fn status_code(&self) -> Option<u16> {
        self.api_error().map(|e| e.status_code)
    }

    /// Parsed error body when the failure came from a JSON response.
    pub fn error_data(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.api_error().and_then(|e| e.error_data.as_ref())
    }

    /// Returns the response error for HTTP-status variants.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Auth(e) | Self::Request(e) | Self::RateLimit(e) | Self::Server(e) => Some(e),
            _ => None,
        }
    }

    /// True for timeouts, including a stream that went idle mid-body.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::StreamInterrupted { timed_out: true, .. }
        )
    }

    /// Classifies a non-success HTTP response by status code.
    pub fn from_status(error: ApiError) -> Self {
        match error.status_code {
            401 => Self::Auth(error),
            429 => Self::RateLimit(error),
            500..=599 => Self::Server(error),
            _ => Self::Request(error),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
