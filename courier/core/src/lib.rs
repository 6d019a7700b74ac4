//! Courier Core - Duplex Request/Response IPC over WebSocket Frames
//!
//! This crate lets one process (a client) invoke named operations (routes)
//! exposed by another process (a server) over a persistent duplex socket
//! connection, plus a lightweight discovery sub-protocol (multicast) that
//! tells a prospective client which port the real server listens on.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   one WebSocket per call    ┌──────────────────────────┐
//! │  ClientSession  │ ──── call frame ──────────▶ │        ServerState       │
//! │  (retry/backoff)│                             │  accept → auth → route   │
//! │                 │ ◀─── response frame ─────── │            │             │
//! └─────────────────┘                             │       RouteTable         │
//!                                                 │            │             │
//!         discovery                               │   handler(Request) ──────┼──▶ IpcEvent
//! ┌─────────────────┐                             │            │             │   notifications
//! │ multicast client│ ◀── {code, primary port} ── │   Request.respond(..)    │
//! └─────────────────┘                             └──────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Server`]: registration facade and lifecycle (`setup`/`start`/`terminate`)
//! - [`ServerState`]: the connection/dispatch engine behind it
//! - [`Request`]: one inbound call with its one-shot completion slot
//! - [`ClientSession`]: per-call connections with bounded retry/backoff
//! - [`IpcEvent`]: request lifecycle notifications toward the hosting process
//!
//! # Quick Start
//!
//! ```ignore
//! use courier_core::{ClientSession, ClientConfig, Server, ServerConfig};
//! use serde_json::{json, Map};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), courier_core::IpcError> {
//!     let (events, _rx) = mpsc::unbounded_channel();
//!     let mut server = Server::new(ServerConfig::default(), events);
//!     server.route("/ping", |req| async move {
//!         req.respond(&json!({"pong": true})).await?;
//!         Ok(())
//!     })?;
//!     server.setup();
//!     server.start().await?;
//!
//!     let session = ClientSession::new(ClientConfig {
//!         port: Some(8000),
//!         secret_key: None,
//!         ..ClientConfig::default()
//!     });
//!     let reply = session.request("/ping", Map::new()).await?;
//!     assert_eq!(reply["pong"], true);
//!
//!     server.terminate().await
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`codec`]: JSON text-frame encoding/decoding
//! - [`config`]: server and client configuration with env loading
//! - [`error`]: the [`IpcError`] taxonomy
//! - [`events`]: lifecycle notifications
//! - [`request`]: inbound requests and their completion slot
//! - [`route`]: route registration and the route table
//! - [`server`]: the registration/lifecycle facade
//! - [`session`]: the caller side
//! - [`state`]: listeners, connection handling, and dispatch

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
mod frame;
pub mod request;
pub mod route;
pub mod server;
pub mod session;
pub mod state;

// Re-exports for convenience
pub use config::{ClientConfig, ServerConfig};
pub use error::IpcError;
pub use events::IpcEvent;
pub use request::Request;
pub use route::{Handler, HandlerFuture, Route, RouteTable};
pub use server::Server;
pub use session::{ClientSession, RetryPolicy};
pub use state::{ConnectionId, EndpointKind, ServerState};
