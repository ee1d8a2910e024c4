//! Error types for ESL operations.
//!
//! All fallible operations in this crate return [`EslResult<T>`]. Errors are
//! classified into two axes for caller convenience:
//!
//! - **Connection errors** ([`EslError::is_connection_error`]) — the TCP
//!   session is dead and the caller should reconnect.
//! - **Recoverable errors** ([`EslError::is_recoverable`]) — the command
//!   failed but the connection is still usable (e.g., timeout, command
//!   rejected).

use thiserror::Error;

/// Result type alias for ESL operations
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by a connecting, running, or closing client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EslError {
    /// IO error from underlying TCP operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A session is already running on this client
    #[error("already connected")]
    AlreadyConnected,

    /// FreeSWITCH rejected the password
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The configured hostname is empty
    #[error("hostname cannot be blank")]
    BlankHostname,

    /// Command returned `-ERR` with an error message from FreeSWITCH
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// The host sent a disconnection notice or closed the connection
    #[error("disconnected by host")]
    Disconnected,

    /// No session is running, or the session ended before the command
    /// received its response
    #[error("not connected")]
    NotConnected,

    /// Internal sentinel raised by [`shutdown`](crate::EslClient::shutdown);
    /// translated to a clean return at the `connect` boundary
    #[error("shutdown was requested")]
    Shutdown,

    /// Timeout dialing, completing the handshake, or submitting a command
    #[error("timeout")]
    Timeout,

    /// FreeSWITCH sent a packet that violates protocol expectations
    #[error("unexpected response from FreeSWITCH")]
    UnexpectedResponse,

    /// Framing violation - malformed headers, bad Content-Length, oversized
    /// or non-UTF-8 packet
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// XML error from the configuration file loader
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl EslError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// `true` if the connection is still usable and the caller can retry.
    ///
    /// Recoverable: `Timeout`, `CommandFailed`, `UnexpectedResponse`.
    /// Non-recoverable errors (I/O, auth, disconnect) mean the connection is
    /// dead and the caller should reconnect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EslError::Timeout | EslError::CommandFailed { .. } | EslError::UnexpectedResponse
        )
    }

    /// `true` if the TCP session is dead and the caller should reconnect.
    ///
    /// Matches: `Io`, `NotConnected`, `Disconnected`, `Protocol`.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EslError::Io(_)
                | EslError::NotConnected
                | EslError::Disconnected
                | EslError::Protocol { .. }
        )
    }
}
