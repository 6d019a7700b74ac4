//! Error Types
//!
//! The error taxonomy for the IPC layer:
//! - Configuration errors surface synchronously at registration/startup time
//!   and are fatal to that call only.
//! - Protocol violations never appear here: they are answered on the wire and
//!   terminate a single connection, not the process.
//! - Transport failures during a response are captured into the request's
//!   completion slot instead of being raised to the handler.

use tokio_tungstenite::tungstenite;

/// Errors produced by the IPC layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IpcError {
    /// Invalid construction-time configuration, such as an empty route name
    /// or an attempt to register a route after the server was set up.
    #[error("configuration error: {0}")]
    Config(String),

    /// `start` was called before `setup` built the listener applications,
    /// or the requested listener (e.g. multicast) is not enabled.
    #[error("server application is not yet set up")]
    NotSetUp,

    /// A JSON value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Low-level socket failure (bind, accept).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// WebSocket-level failure (handshake, send, receive).
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A second response was attempted on a request that already recorded
    /// its outcome. At-most-once response is the core request invariant.
    #[error("request has already been responded to")]
    AlreadyResponded,

    /// The reconnection budget was exhausted while the server kept reporting
    /// a closed channel.
    #[error("server disconnected after {attempts} reconnection attempts")]
    ServerDisconnected {
        /// How many reconnection polls were made before giving up.
        attempts: u32,
        /// Close reason reported by the peer, if any.
        reason: Option<String>,
    },

    /// The keepalive budget was exhausted: the peer answered every request
    /// frame with a protocol PING or PONG instead of a body.
    #[error("request abandoned after {retries} keepalive retries")]
    KeepaliveExceeded {
        /// How many PING/PONG round trips were tolerated before giving up.
        retries: u32,
    },
}

impl From<tungstenite::Error> for IpcError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}
