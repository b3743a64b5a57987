//! Error types for the control-port client and the webhook notifier.
//!
//! Control-port failures fall into two families: connection errors, which
//! are recovered by dropping the socket and reconnecting on the next call,
//! and protocol errors, where Tor answered but not with what we asked for.

use std::io;
use thiserror::Error;

/// Errors produced while talking to Tor's control port.
#[derive(Error, Debug)]
pub enum ControlError {
    /// I/O error occurred during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Could not open a connection to the control port.
    #[error("failed to connect to tor control port: {0}")]
    ConnectionFailed(String),

    /// Tor refused the configured shared secret.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command was rejected by Tor.
    #[error("command rejected (code {code}): {message}")]
    CommandRejected {
        /// The status code returned by Tor.
        code: u16,
        /// The human-readable error message.
        message: String,
    },

    /// Reply did not follow the control-port grammar.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Timed out waiting on the control port.
    #[error("control port operation timed out")]
    Timeout,

    /// The connection was closed unexpectedly.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}

impl ControlError {
    /// True for failures where the socket itself is suspect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ControlError::Io(_)
                | ControlError::ConnectionFailed(_)
                | ControlError::Timeout
                | ControlError::ConnectionClosed
        )
    }
}

/// Result type alias for control-port operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors produced while delivering a webhook notification.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The payload could not be serialized.
    #[error("formatting payload: {0}")]
    Format(#[from] serde_json::Error),

    /// The POST never got a response.
    #[error("sending request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The receiver answered with a non-2xx status.
    #[error("webhook returned status {status}: {body}")]
    Status {
        /// HTTP status returned by the receiver.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The delivery did not finish within its timeout.
    #[error("webhook delivery timed out")]
    Timeout,
}

/// Reply status codes the client cares about, as defined by the Tor control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 250 - OK
    Ok = 250,
    /// 251 - Operation was unnecessary
    OperationUnnecessary = 251,
    /// 510 - Unrecognized command
    UnrecognizedCommand = 510,
    /// 512 - Syntax error in command argument
    SyntaxErrorArgument = 512,
    /// 514 - Authentication required
    AuthenticationRequired = 514,
    /// 515 - Bad authentication
    BadAuthentication = 515,
    /// 552 - Unrecognized entity
    UnrecognizedEntity = 552,
    /// 650 - Asynchronous event notification
    AsyncEvent = 650,
    /// Anything else
    Unknown = 0,
}

impl StatusCode {
    /// Parse a status code from a u16 value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            250 => StatusCode::Ok,
            251 => StatusCode::OperationUnnecessary,
            510 => StatusCode::UnrecognizedCommand,
            512 => StatusCode::SyntaxErrorArgument,
            514 => StatusCode::AuthenticationRequired,
            515 => StatusCode::BadAuthentication,
            552 => StatusCode::UnrecognizedEntity,
            650 => StatusCode::AsyncEvent,
            _ => StatusCode::Unknown,
        }
    }

    /// Check if this status code indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::OperationUnnecessary)
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode::from_u16(code)
    }
}
