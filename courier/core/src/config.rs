//! Configuration
//!
//! Construction-time parameters for the server and the client session, with
//! the protocol's defaults and environment-variable loading.
//!
//! # Environment Variables
//!
//! - `COURIER_HOST`: Host to bind or connect to (default: localhost)
//! - `COURIER_PORT`: Primary endpoint port (default: 8000; unset on the
//!   client means "use the multicast port")
//! - `COURIER_SECRET`: Shared secret for the `Authorization` header
//! - `COURIER_MULTICAST`: "0" or "false" to disable the multicast listener
//! - `COURIER_MULTICAST_PORT`: Discovery endpoint port (default: 20000)

use serde::{Deserialize, Serialize};

/// Default host for both endpoints.
pub const DEFAULT_HOST: &str = "localhost";
/// Default primary endpoint port.
pub const DEFAULT_PORT: u16 = 8000;
/// Default multicast (discovery) endpoint port.
pub const DEFAULT_MULTICAST_PORT: u16 = 20000;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the listeners on.
    pub host: String,
    /// Port for the primary endpoint.
    pub port: u16,
    /// Shared secret checked against the `Authorization` header.
    ///
    /// `None` means keyless: clients must send a JSON `null` to match.
    pub secret_key: Option<String>,
    /// Whether to run the multicast discovery listener.
    pub multicast: bool,
    /// Port for the multicast discovery listener.
    pub multicast_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secret_key: None,
            multicast: true,
            multicast_port: DEFAULT_MULTICAST_PORT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("COURIER_HOST").unwrap_or(defaults.host),
            port: std::env::var("COURIER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            secret_key: std::env::var("COURIER_SECRET").ok(),
            multicast: std::env::var("COURIER_MULTICAST")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(defaults.multicast),
            multicast_port: std::env::var("COURIER_MULTICAST_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.multicast_port),
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host to connect to.
    pub host: String,
    /// Primary endpoint port. `None` resolves to the multicast port.
    pub port: Option<u16>,
    /// Multicast (discovery) endpoint port.
    pub multicast_port: u16,
    /// Shared secret sent in the `Authorization` header.
    pub secret_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            multicast_port: DEFAULT_MULTICAST_PORT,
            secret_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("COURIER_HOST").unwrap_or(defaults.host),
            port: std::env::var("COURIER_PORT").ok().and_then(|v| v.parse().ok()),
            multicast_port: std::env::var("COURIER_MULTICAST_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.multicast_port),
            secret_key: std::env::var("COURIER_SECRET").ok(),
        }
    }
}
