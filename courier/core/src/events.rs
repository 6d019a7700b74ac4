//! Lifecycle Notifications
//!
//! Events the server raises toward its hosting process as requests move
//! through dispatch. The hosting process hands the server an unbounded
//! channel sender at construction and drains the receiver however it likes;
//! dispatch is fire-and-forget and never blocks a connection task.

use crate::request::Request;

/// Request lifecycle events emitted by the server.
#[derive(Debug, Clone)]
pub enum IpcEvent {
    /// A request was decoded and authorized; fired before its handler runs.
    RawRequest(Request),
    /// The handler invocation for a request returned.
    RequestCompletion(Request),
}

impl IpcEvent {
    /// The request this event carries.
    #[must_use]
    pub fn request(&self) -> &Request {
        match self {
            Self::RawRequest(request) | Self::RequestCompletion(request) => request,
        }
    }
}
