//! Frame Protocol
//!
//! Wire shapes for the request/response protocol and the validation of
//! inbound call frames. One WebSocket text frame carries one JSON document.
//!
//! # Call frame
//!
//! ```text
//! {"endpoint": "/name", "data": {...}, "headers": {"Authorization": "<secret-or-null>"}}
//! ```
//!
//! Validation of a decoded frame is an exhaustive match over [`FrameCheck`]:
//! either the frame dispatches to a route, or it is rejected with a
//! [`ProtocolViolation`] that maps to a fixed error body. Rejections are
//! answered on the wire and never crash the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::route::RouteTable;

/// One inbound or outbound call frame.
///
/// Every field is optional on decode so that validation, not deserialization,
/// decides how a malformed frame is answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CallFrame {
    /// Route name the frame targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Call arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Frame headers; the normal path carries an `Authorization` entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
}

/// Structured error reply sent for a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ErrorReply {
    /// Human-readable error message.
    pub error: String,
    /// Protocol status code.
    pub code: u16,
}

/// Reply sent by the multicast endpoint on successful authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MulticastHello {
    /// Fixed confirmation message.
    pub message: String,
    /// Protocol status code.
    pub code: u16,
    /// Port the primary endpoint is bound to.
    pub port: u16,
}

impl MulticastHello {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            message: "Successfully connected".to_string(),
            code: 200,
            port,
        }
    }
}

/// Ways a call frame can fail validation on the primary endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolViolation {
    /// The frame carried no `endpoint` key.
    MissingEndpoint,
    /// The endpoint is not present in the route table.
    UnknownEndpoint,
    /// The headers carried no `Authorization` entry.
    MissingAuthorization,
    /// The `Authorization` value did not match the configured secret.
    InvalidAuthorization,
}

impl ProtocolViolation {
    /// The error body sent on the primary endpoint for this violation.
    pub(crate) fn reply(self) -> ErrorReply {
        let (error, code) = match self {
            Self::MissingEndpoint => ("No endpoint was set", 401),
            Self::UnknownEndpoint => ("Invalid endpoint provided", 400),
            Self::MissingAuthorization => ("Unauthorized", 401),
            Self::InvalidAuthorization => ("Unauthorized", 403),
        };
        ErrorReply {
            error: error.to_string(),
            code,
        }
    }
}

/// Outcome of validating a decoded call frame against a route table and a
/// configured secret.
#[derive(Debug)]
pub(crate) enum FrameCheck {
    /// The frame passed every check and may be dispatched.
    Dispatch {
        /// Validated route name.
        endpoint: String,
        /// Call arguments; empty when the frame carried none.
        data: Map<String, Value>,
        /// Frame headers; retained even though authorization already passed.
        headers: Map<String, Value>,
    },
    /// The frame failed a check; the violation decides the error body.
    Reject(ProtocolViolation),
}

impl CallFrame {
    /// Validate this frame in the order the protocol mandates: endpoint
    /// present, endpoint registered, authorization present, authorization
    /// valid.
    pub(crate) fn check(self, routes: &RouteTable, secret_key: Option<&str>) -> FrameCheck {
        let Some(endpoint) = self.endpoint else {
            return FrameCheck::Reject(ProtocolViolation::MissingEndpoint);
        };
        if !routes.contains(&endpoint) {
            return FrameCheck::Reject(ProtocolViolation::UnknownEndpoint);
        }

        let headers = self.headers.unwrap_or_default();
        let Some(provided) = headers.get("Authorization") else {
            return FrameCheck::Reject(ProtocolViolation::MissingAuthorization);
        };
        if !authorization_matches(provided, secret_key) {
            return FrameCheck::Reject(ProtocolViolation::InvalidAuthorization);
        }

        FrameCheck::Dispatch {
            endpoint,
            data: self.data.unwrap_or_default(),
            headers,
        }
    }
}

/// Compare a provided `Authorization` value against the configured secret.
///
/// A keyless server stores `None`; a client matches it by sending a JSON
/// `null`. String comparison avoids an early exit on the first differing
/// byte.
pub(crate) fn authorization_matches(provided: &Value, secret_key: Option<&str>) -> bool {
    match (provided, secret_key) {
        (Value::Null, None) => true,
        (Value::String(value), Some(secret)) => constant_time_eq(value, secret),
        _ => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
