//! Xylo error types.
//!
//! The taxonomy separates failures by who recovers from them:
//!
//! - `Transport` and `Stream` are connection-fatal and funnel through
//!   [`Session::notify_failure`](crate::session::Session::notify_failure).
//! - `Stanza` and `NoResponse` are returned to the one caller of
//!   [`Session::query`](crate::session::Session::query) and never affect
//!   other in-flight requests.
//! - `Login` reverts session status without closing the transport.
//! - `IllegalState` marks programmer errors (lifecycle calls out of order).

use thiserror::Error;

use crate::stanza::StanzaError;

/// Xylo errors.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure opening or using the underlying channel.
    ///
    /// During `connect()` this triggers fallback to the next transport
    /// candidate; afterwards it triggers `notify_failure`.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server-sent fatal protocol violation. Always closes the stream.
    #[error("Stream error: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Stream {
        /// Defined stream error condition, e.g. `conflict`.
        condition: String,
        /// Optional human-readable text supplied by the server.
        text: Option<String>,
    },

    /// An error-kind response to a specific request.
    #[error("Stanza error: {0}")]
    Stanza(StanzaError),

    /// A synchronous request timed out without a matching response.
    #[error("No response received within the timeout")]
    NoResponse,

    /// Authentication or resource binding failed.
    #[error("Login failed: {0}")]
    Login(String),

    /// Lifecycle or contract violation by the caller.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Feature negotiation could not proceed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// XML decoding error from the stream codec.
    #[error("XML error: {0}")]
    Xml(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Xylo operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this is a `conflict` stream error, meaning another session
    /// replaced this one. Conflicts never trigger reconnection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Stream { condition, .. } if condition == "conflict")
    }

    /// Clone-lite for fan-out: status change callbacks and the reconnect
    /// policy receive a descriptive copy, not the original value.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Transport(s) => Error::Transport(s.clone()),
            Error::Stream { condition, text } => Error::Stream {
                condition: condition.clone(),
                text: text.clone(),
            },
            Error::Stanza(e) => Error::Stanza(e.clone()),
            Error::NoResponse => Error::NoResponse,
            Error::Login(s) => Error::Login(s.clone()),
            Error::IllegalState(s) => Error::IllegalState(s.clone()),
            Error::Negotiation(s) => Error::Negotiation(s.clone()),
            Error::Xml(s) => Error::Xml(s.clone()),
            Error::Config(s) => Error::Config(s.clone()),
            Error::Io(e) => Error::Transport(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}
