//! Server State — the connection/dispatch engine
//!
//! Owns the two listening endpoints (primary + multicast), accepts duplex
//! WebSocket connections, authorizes each inbound frame, dispatches to the
//! route table, and emits lifecycle notifications toward the hosting process.
//!
//! # Per-connection state machine (primary endpoint)
//!
//! Each accepted connection is upgraded to a WebSocket and served by its own
//! task. For every inbound text frame until the channel closes:
//!
//! 1. Decode the frame. A malformed frame is dropped with no reply.
//! 2. Validate endpoint presence, endpoint registration, authorization
//!    presence and authorization value, answering the fixed error bodies.
//! 3. Construct a [`Request`], notify `RawRequest`, await the handler to
//!    completion, notify `RequestCompletion`.
//!
//! Validation failures terminate the connection's processing, not just the
//! offending frame. Frames on one connection are handled strictly in arrival
//! order; different connections are independent tasks.
//!
//! # Multicast endpoint
//!
//! A reduced discovery protocol: authorization only, answered with the port
//! the primary endpoint is bound to. No routing concepts apply.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::codec;
use crate::config::ServerConfig;
use crate::error::IpcError;
use crate::events::IpcEvent;
use crate::frame::{authorization_matches, CallFrame, ErrorReply, FrameCheck, MulticastHello};
use crate::request::{ReplySink, Request};
use crate::route::RouteTable;

/// Identifier for one accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which of the two listening endpoints is meant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// The request/response endpoint.
    Primary,
    /// The discovery endpoint.
    Multicast,
}

/// State shared with every connection task.
struct SharedState {
    routes: Arc<RouteTable>,
    secret_key: Option<String>,
    events: mpsc::UnboundedSender<IpcEvent>,
    /// Resolved at bind time so a port-0 bind advertises its real port.
    primary_port: AtomicU16,
}

impl SharedState {
    fn dispatch(&self, event: IpcEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped; notification discarded");
        }
    }
}

/// A listener application constructed by `setup`.
struct ListenerApp {
    host: String,
    port: u16,
}

/// Bookkeeping for one started listener.
struct AppRunner {
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// The connection/dispatch engine behind a server instance.
pub struct ServerState {
    config: ServerConfig,
    events: mpsc::UnboundedSender<IpcEvent>,
    shared: Option<Arc<SharedState>>,
    apps: HashMap<EndpointKind, ListenerApp>,
    runners: HashMap<EndpointKind, AppRunner>,
    connections: Arc<DashMap<ConnectionId, AbortHandle>>,
}

impl ServerState {
    /// Create an engine that will notify the hosting process through
    /// `events`.
    #[must_use]
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<IpcEvent>) -> Self {
        Self {
            config,
            events,
            shared: None,
            apps: HashMap::new(),
            runners: HashMap::new(),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Construct the listener applications and freeze the route table.
    ///
    /// Calling again once set up is a no-op.
    pub fn setup(&mut self, routes: RouteTable) {
        if self.shared.is_some() {
            return;
        }

        self.apps.insert(
            EndpointKind::Primary,
            ListenerApp {
                host: self.config.host.clone(),
                port: self.config.port,
            },
        );
        if self.config.multicast {
            self.apps.insert(
                EndpointKind::Multicast,
                ListenerApp {
                    host: self.config.host.clone(),
                    port: self.config.multicast_port,
                },
            );
        }

        self.shared = Some(Arc::new(SharedState {
            routes: Arc::new(routes),
            secret_key: self.config.secret_key.clone(),
            events: self.events.clone(),
            primary_port: AtomicU16::new(self.config.port),
        }));
    }

    /// Whether `setup` has run.
    #[must_use]
    pub fn is_set_up(&self) -> bool {
        self.shared.is_some()
    }

    /// Bind the requested application and begin accepting connections,
    /// recording the runner so `terminate` can tear it down.
    ///
    /// Returns the bound address (meaningful when the configured port is 0).
    ///
    /// # Errors
    ///
    /// [`IpcError::NotSetUp`] when called before [`ServerState::setup`] or
    /// when the multicast application is disabled; [`IpcError::Config`] when
    /// the listener is already running; [`IpcError::Io`] when the bind fails.
    pub async fn start(&mut self, multicast: bool) -> Result<SocketAddr, IpcError> {
        let kind = if multicast {
            EndpointKind::Multicast
        } else {
            EndpointKind::Primary
        };
        let shared = self.shared.clone().ok_or(IpcError::NotSetUp)?;
        let app = self.apps.get(&kind).ok_or(IpcError::NotSetUp)?;
        if self.runners.contains_key(&kind) {
            return Err(IpcError::Config(format!("{kind:?} listener already started")));
        }

        let listener = TcpListener::bind((app.host.as_str(), app.port)).await?;
        let addr = listener.local_addr()?;
        if kind == EndpointKind::Primary {
            shared.primary_port.store(addr.port(), Ordering::SeqCst);
        }

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(
            accept_loop(
                kind,
                listener,
                Arc::clone(&shared),
                Arc::clone(&self.connections),
                Arc::clone(&shutdown),
            )
            .instrument(info_span!("listener", kind = ?kind, addr = %addr)),
        );

        info!(kind = ?kind, addr = %addr, "IPC listener started");
        self.runners.insert(kind, AppRunner {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// The bound address of a started listener.
    #[must_use]
    pub fn local_addr(&self, kind: EndpointKind) -> Option<SocketAddr> {
        self.runners.get(&kind).map(|runner| runner.addr)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shut down every started listener and abort live connection tasks.
    ///
    /// Safe to call with nothing started and safe to call repeatedly; each
    /// bookkeeping entry is removed exactly once.
    pub async fn terminate(&mut self) -> Result<(), IpcError> {
        for (kind, runner) in self.runners.drain() {
            runner.shutdown.notify_one();
            runner.task.abort();
            let _ = runner.task.await;
            info!(kind = ?kind, addr = %runner.addr, "IPC listener stopped");
        }

        for entry in self.connections.iter() {
            entry.value().abort();
        }
        self.connections.clear();
        Ok(())
    }
}

async fn accept_loop(
    kind: EndpointKind,
    listener: TcpListener,
    shared: Arc<SharedState>,
    connections: Arc<DashMap<ConnectionId, AbortHandle>>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("Shutdown requested, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                };

                let conn_id = ConnectionId::new();
                debug!(conn_id = %conn_id, peer = %peer, "Connection accepted");

                let shared = Arc::clone(&shared);
                let connections_for_task = Arc::clone(&connections);
                let task = tokio::spawn(
                    async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => match kind {
                                EndpointKind::Primary => handle_connection(ws, &shared).await,
                                EndpointKind::Multicast => handle_multicast(ws, &shared).await,
                            },
                            Err(e) => warn!(error = %e, "WebSocket handshake failed"),
                        }
                        connections_for_task.remove(&conn_id);
                        debug!("Connection ended");
                    }
                    .instrument(info_span!("connection", conn_id = %conn_id)),
                );
                connections.insert(conn_id, task.abort_handle());
            }
        }
    }
}

/// Shared write half of one connection.
type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// Reply sink handed to [`Request`]s created on a connection.
struct WsReplySink {
    sink: WsSink,
}

#[async_trait::async_trait]
impl ReplySink for WsReplySink {
    async fn send_text(&self, text: String) -> Result<(), IpcError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(IpcError::from)
    }
}

async fn send_json<T: Serialize>(sink: &WsSink, body: &T) -> Result<(), IpcError> {
    let text = codec::encode(body)?;
    debug!(payload = %text, "IPC ->");
    sink.lock()
        .await
        .send(Message::Text(text))
        .await
        .map_err(IpcError::from)
}

/// Pull the JSON text out of one WebSocket message.
///
/// `Ok(None)` means "nothing to process, keep reading"; `Err(())` means the
/// connection is finished (close frame, receive error, or an unusable
/// payload).
#[allow(clippy::result_unit_err)]
fn frame_text(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Result<Option<String>, ()> {
    match message {
        Ok(Message::Text(text)) => Ok(Some(text)),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Ok(Some(text)),
            Err(_) => {
                warn!("Dropping non-UTF-8 binary frame");
                Err(())
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => Ok(None),
        Ok(Message::Close(_)) => Err(()),
        Err(e) => {
            warn!(error = %e, "Receive error");
            Err(())
        }
    }
}

async fn handle_connection(ws: WebSocketStream<TcpStream>, shared: &SharedState) {
    let (sink, mut stream) = ws.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    let reply: Arc<dyn ReplySink> = Arc::new(WsReplySink {
        sink: Arc::clone(&sink),
    });

    while let Some(message) = stream.next().await {
        let text = match frame_text(message) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(()) => return,
        };

        debug!(payload = %text, "IPC <-");

        let frame: CallFrame = match codec::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed JSON gets silence: drop the frame, end processing.
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match frame.check(&shared.routes, shared.secret_key.as_deref()) {
            FrameCheck::Reject(violation) => {
                warn!(violation = ?violation, "Rejecting frame");
                if let Err(e) = send_json(&sink, &violation.reply()).await {
                    warn!(error = %e, "Failed to deliver error reply");
                }
                // A shape or authorization violation ends the connection's
                // processing, not just the offending frame.
                return;
            }
            FrameCheck::Dispatch {
                endpoint,
                data,
                headers,
            } => {
                let Some(route) = shared.routes.get(&endpoint) else {
                    continue;
                };
                let request = Request::new(data, endpoint.clone(), headers, Arc::clone(&reply));
                shared.dispatch(IpcEvent::RawRequest(request.clone()));

                // The handler is awaited before the next frame is read:
                // frames on one connection are processed serially.
                match route.call(request.clone()).await {
                    Ok(()) => shared.dispatch(IpcEvent::RequestCompletion(request)),
                    Err(e) => {
                        error!(endpoint = %endpoint, error = %e, "Route handler failed");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_multicast(ws: WebSocketStream<TcpStream>, shared: &SharedState) {
    let (sink, mut stream) = ws.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    while let Some(message) = stream.next().await {
        let text = match frame_text(message) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(()) => return,
        };

        debug!(payload = %text, "IPC Multicast <-");

        let frame: CallFrame = match codec::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let headers = frame.headers.unwrap_or_default();
        let authorized = headers
            .get("Authorization")
            .is_some_and(|value| authorization_matches(value, shared.secret_key.as_deref()));
        if !authorized {
            warn!("Received an unauthorized discovery request");
            // Missing and mismatched keys both map to 403 on this endpoint.
            let reply = ErrorReply {
                error: "Unauthorized".to_string(),
                code: 403,
            };
            if let Err(e) = send_json(&sink, &reply).await {
                warn!(error = %e, "Failed to deliver error reply");
            }
            return;
        }

        let hello = MulticastHello::new(shared.primary_port.load(Ordering::SeqCst));
        if let Err(e) = send_json(&sink, &hello).await {
            warn!(error = %e, "Failed to deliver discovery reply");
            return;
        }
    }
}
