use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

use crate::matrix::settings::SettingsError;

/// Errcode the homeserver uses when the access token is no longer valid.
pub const M_UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";
/// Errcode for rate limiting; usually carries `retry_after_ms`.
pub const M_LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("sync requires a valid next_batch token, perform an initial sync first")]
    MissingSyncToken,

    #[error("access token rejected by homeserver: {message}")]
    InvalidToken { message: String },

    #[error("wrong username or password")]
    WrongCredentials,

    #[error("{message} ({errcode}, HTTP {status})")]
    Server {
        status: u16,
        errcode: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed with HTTP {status}")]
    Http { status: u16 },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("{0} endpoint was not found on the server")]
    EndpointNotFound(&'static str),

    #[error("invalid homeserver url: {0}")]
    InvalidHomeserver(String),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid room id or alias: {0}")]
    InvalidRoomId(String),

    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    #[error("invalid mxc uri: {0}")]
    InvalidMxcUri(String),

    #[error("filter definition is not a JSON object")]
    InvalidFilter,

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request cancelled")]
    Cancelled,
}

/// Broad category of a [`MatrixError`], used to pick the caller's reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller bug; fix the calling code.
    Precondition,
    /// Credentials rejected; the session is over.
    Auth,
    /// Structured error from the homeserver.
    Server,
    /// No structured body available.
    Transport,
    /// Malformed success response.
    Decode,
    /// Invalid local input or a server that does not speak Matrix.
    Config,
    /// Local persistence failure.
    Storage,
    /// Dropped because the session was cancelled.
    Cancelled,
}

impl MatrixError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingSyncToken => ErrorClass::Precondition,
            Self::InvalidToken { .. } | Self::WrongCredentials => ErrorClass::Auth,
            Self::Server { .. } => ErrorClass::Server,
            Self::Transport(_) | Self::Http { .. } => ErrorClass::Transport,
            Self::Decode(_) | Self::UnexpectedResponse(_) => ErrorClass::Decode,
            Self::EndpointNotFound(_)
            | Self::InvalidHomeserver(_)
            | Self::InvalidUserId(_)
            | Self::InvalidRoomId(_)
            | Self::InvalidEventId(_)
            | Self::InvalidMxcUri(_)
            | Self::InvalidFilter => ErrorClass::Config,
            Self::Settings(_) | Self::Io(_) => ErrorClass::Storage,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether the operation may be retried, typically after a backoff.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Server | ErrorClass::Transport | ErrorClass::Decode
        )
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Server { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// The homeserver errcode, for errors that carry one.
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Server { errcode, .. } => Some(errcode),
            Self::InvalidToken { .. } => Some(M_UNKNOWN_TOKEN),
            _ => None,
        }
    }
}

/// Standard Matrix error body: `{"errcode": "...", "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerError {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

impl ServerError {
    /// Decode a structured error body. Anything without an errcode is `None`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    pub fn into_error(self, status: u16) -> MatrixError {
        if self.errcode == M_UNKNOWN_TOKEN {
            return MatrixError::InvalidToken {
                message: self.error,
            };
        }

        MatrixError::Server {
            status,
            errcode: self.errcode,
            message: self.error,
            retry_after_ms: self.retry_after_ms,
        }
    }
}

/// Status 0 stands for "no HTTP status at all".
pub fn is_error_status(status: u16) -> bool {
    status == 0 || status >= 400
}

/// Classify a failed response from its status and raw body.
pub fn classify_failure(status: u16, body: &[u8]) -> MatrixError {
    match ServerError::parse(body) {
        Some(err) => err.into_error(status),
        None => MatrixError::Http { status },
    }
}

/// Turn a completed response into a typed payload.
///
/// A success-range body that does not match `T` but does decode as a
/// structured error is classified as that error, so an unknown-token
/// response is never mistaken for a parse failure.
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, MatrixError> {
    if is_error_status(status) {
        return Err(classify_failure(status, body));
    }

    match serde_json::from_slice(body) {
        Ok(value) => Ok(value),
        Err(e) => match ServerError::parse(body) {
            Some(err) => Err(err.into_error(status)),
            None => Err(MatrixError::Decode(e)),
        },
    }
}
