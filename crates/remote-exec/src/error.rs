//! Error types for remote execution

use thiserror::Error;

/// Result type for remote execution operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while connecting to or driving a remote host
#[derive(Debug, Error)]
pub enum Error {
    /// The remote host could not be reached or refused authentication
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host the connection was attempted against
        host: String,
        /// Diagnostic output from the transport
        message: String,
    },

    /// A file transfer to the remote host failed
    #[error("transfer to {dest} failed: {message}")]
    Transfer {
        /// Remote destination of the transfer
        dest: String,
        /// Diagnostic output from the transport
        message: String,
    },

    /// The transport process could not be spawned or awaited
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
