//! Server Facade
//!
//! [`Server`] is what a hosting process constructs: it collects route
//! registrations, then drives the [`ServerState`](crate::state::ServerState)
//! engine through its lifecycle (`setup` → `start` → `terminate`).
//!
//! Routes are registered before `setup`; the table is frozen there and
//! shared read-only with every connection task afterwards.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::IpcError;
use crate::events::IpcEvent;
use crate::route::{Handler, Route, RouteTable};
use crate::state::{EndpointKind, ServerState};

/// The IPC server.
pub struct Server {
    config: ServerConfig,
    routes: Option<RouteTable>,
    state: ServerState,
}

impl Server {
    /// Create a server.
    ///
    /// Request lifecycle notifications are delivered through `events`; the
    /// hosting process owns the receiving end.
    #[must_use]
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<IpcEvent>) -> Self {
        let state = ServerState::new(config.clone(), events);
        Self {
            config,
            routes: Some(RouteTable::new()),
            state,
        }
    }

    /// Register a route.
    ///
    /// The name gets a leading `/` prepended when missing; registering an
    /// already-taken name replaces the previous handler (last one wins).
    ///
    /// # Errors
    ///
    /// [`IpcError::Config`] when the name is empty or the server is already
    /// set up — the route table is frozen at [`Server::setup`].
    pub fn route<H: Handler>(&mut self, name: &str, handler: H) -> Result<Route, IpcError> {
        let Some(routes) = self.routes.as_mut() else {
            return Err(IpcError::Config(
                "routes must be registered before setup".to_string(),
            ));
        };
        let route = Route::new(name, handler)?;
        routes.insert(route.clone());
        Ok(route)
    }

    /// The secret key required for request authorization, or `None`.
    #[must_use]
    pub fn secret_key(&self) -> Option<&str> {
        self.config.secret_key.as_deref()
    }

    /// The WebSocket URL of the primary endpoint.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.config.host, self.config.port)
    }

    /// The WebSocket URL of the multicast endpoint.
    #[must_use]
    pub fn multicast_ws_url(&self) -> String {
        format!("ws://{}:{}", self.config.host, self.config.multicast_port)
    }

    /// Construct the listener applications, freezing the route table.
    ///
    /// Calling again once set up is a no-op.
    pub fn setup(&mut self) {
        if self.state.is_set_up() {
            return;
        }
        let routes = self.routes.take().unwrap_or_default();
        self.state.setup(routes);
    }

    /// Start the primary endpoint and, when enabled, the multicast endpoint.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotSetUp`] when called before [`Server::setup`];
    /// [`IpcError::Io`] when a bind fails.
    pub async fn start(&mut self) -> Result<(), IpcError> {
        self.state.start(false).await?;
        if self.config.multicast {
            self.state.start(true).await?;
        }
        Ok(())
    }

    /// Start one listener application, returning its bound address.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Server::start`], plus [`IpcError::NotSetUp`] when
    /// `multicast` is requested but disabled in the configuration.
    pub async fn start_application(&mut self, multicast: bool) -> Result<SocketAddr, IpcError> {
        self.state.start(multicast).await
    }

    /// The bound address of a started listener.
    #[must_use]
    pub fn local_addr(&self, kind: EndpointKind) -> Option<SocketAddr> {
        self.state.local_addr(kind)
    }

    /// Number of live connections across both endpoints.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    /// Shut down and clean up both listeners if they were started.
    ///
    /// Tolerates being called with nothing started, and repeated calls.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the teardown surface uniform
    /// with `start`.
    pub async fn terminate(&mut self) -> Result<(), IpcError> {
        self.state.terminate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(multicast: bool) -> (Server, mpsc::UnboundedReceiver<IpcEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            secret_key: Some("secret".to_string()),
            multicast,
            multicast_port: 0,
        };
        (Server::new(config, events), rx)
    }

    #[test]
    fn test_route_name_normalized() {
        let (mut server, _rx) = test_server(false);
        let route = server.route("ping", |_req| async { Ok(()) }).unwrap();
        assert_eq!(route.name(), "/ping");
    }

    #[test]
    fn test_empty_route_name_rejected() {
        let (mut server, _rx) = test_server(false);
        let result = server.route("", |_req| async { Ok(()) });
        assert!(matches!(result, Err(IpcError::Config(_))));
    }

    #[test]
    fn test_registration_after_setup_rejected() {
        let (mut server, _rx) = test_server(false);
        server.setup();
        let result = server.route("/late", |_req| async { Ok(()) });
        assert!(matches!(result, Err(IpcError::Config(_))));
    }

    #[test]
    fn test_urls_reflect_config() {
        let (events, _rx) = mpsc::unbounded_channel();
        let server = Server::new(ServerConfig::default(), events);
        assert_eq!(server.ws_url(), "ws://localhost:8000");
        assert_eq!(server.multicast_ws_url(), "ws://localhost:20000");
        assert!(server.secret_key().is_none());
    }

    #[tokio::test]
    async fn test_start_before_setup_is_usage_fault() {
        let (mut server, _rx) = test_server(false);
        let result = server.start().await;
        assert!(matches!(result, Err(IpcError::NotSetUp)));
    }

    #[tokio::test]
    async fn test_lifecycle_smoke() {
        let (mut server, _rx) = test_server(true);
        server.route("/ping", |_req| async { Ok(()) }).unwrap();
        server.setup();
        server.start().await.unwrap();

        assert!(server.local_addr(EndpointKind::Primary).is_some());
        assert!(server.local_addr(EndpointKind::Multicast).is_some());

        server.terminate().await.unwrap();
        server.terminate().await.unwrap();
        assert!(server.local_addr(EndpointKind::Primary).is_none());
    }
}
