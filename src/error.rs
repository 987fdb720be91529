//! Public error types.
//!
//! Faults on an individual socket never surface here: they are handled by
//! the socket state machine and reported through `Dispatcher` callbacks.
//! These errors cover setup and lifecycle operations only.

use thiserror::Error;

use crate::config::loader::ConfigError;

/// Errors returned by messenger setup and lifecycle operations.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called twice.
    #[error("messenger already started")]
    AlreadyStarted,

    /// `bind` was called after `start`.
    #[error("messenger already bound or started")]
    AlreadyBound,

    /// The messenger is shutting down and refuses new work.
    #[error("messenger is shutting down")]
    ShuttingDown,

    /// An entity name could not be parsed.
    #[error("invalid entity name: {0}")]
    InvalidName(String),

    /// An entity address could not be parsed.
    #[error("invalid entity address: {0}")]
    InvalidAddress(String),

    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Any other I/O failure during setup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;

/// Why a socket's stream failed. Internal: every variant routes into the
/// socket fault transition and is only ever logged.
#[derive(Debug, Error)]
pub(crate) enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] crate::msg::wire::WireError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("stream shut down")]
    Shutdown,

    #[error("injected socket failure")]
    Injected,
}
