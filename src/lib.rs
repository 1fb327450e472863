//! Peerchat - peer-to-peer chat with a rendezvous directory
//!
//! Peers register their address with a central directory, look each other up
//! there, and then exchange chat lines over direct TCP connections. The
//! directory also keeps friendships and a persisted copy of every chat line.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod directory;
pub mod listener;
pub mod net;
pub mod node;
pub mod outbound;
pub mod protocol;
pub mod rendezvous;
pub mod repl;
pub mod session;

#[cfg(test)]
mod tests;

/// Result type alias for Peerchat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Peerchat operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory could not be reached, timed out, or answered garbage
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The directory answered but refused the request
    #[error("Directory rejected request with status {status}: {body}")]
    DirectoryRejected {
        /// HTTP status code returned by the directory
        status: u16,
        /// Response body, for display
        body: String,
    },

    /// The listening socket could not be bound
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        /// Port that was requested
        port: u16,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A peer refused the connection or did not answer in time
    #[error("Peer {0} is offline or refused the connection")]
    PeerOffline(String),

    /// A peer sent something that violates the line protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation needs a logged-in session
    #[error("Not logged in")]
    NotLoggedIn,

    /// Login was requested while a session is active
    #[error("Already logged in as {0}")]
    AlreadyLoggedIn(String),

    /// The session a task belonged to has ended
    #[error("Session closed")]
    SessionClosed,

    /// The username is not known to the directory
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Rendezvous storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP/Hyper error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Initialize logging for the Peerchat binaries
///
/// Log lines go to stderr so they never interleave with REPL output on
/// stdout. The filter defaults to `info` and honours `RUST_LOG`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
