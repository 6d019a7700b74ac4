//! Client Session
//!
//! A thin caller for the IPC server. Each call opens its own WebSocket
//! connection, sends one framed request, and awaits one reply; the
//! connection is released on every exit path. Requests are independent and
//! short-lived control-plane calls, so per-call connections trade one
//! handshake per call for freedom from multiplexed-stream bookkeeping and
//! head-of-line blocking.
//!
//! # Retry behavior
//!
//! Protocol PING/PONG frames are treated as keepalives: the session answers
//! a PING with a PONG and retries the whole request on a fresh connection.
//! A closed channel enters a bounded reconnection loop with a growing
//! backoff; exhausting the budget surfaces
//! [`IpcError::ServerDisconnected`]. Both loops are explicit and bounded —
//! a misbehaving peer cannot grow the stack or spin the session forever.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::ClientConfig;
use crate::error::IpcError;
use crate::frame::CallFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Timing and budget for the session's retry loops.
///
/// The defaults match the protocol's reference schedule: wait 5 s after the
/// first closed signal, then poll with a backoff starting at 5.5 s growing
/// by 0.5 s × attempt, giving up after 5 reconnection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep after the first closed signal, before polling begins.
    pub initial_close_delay: Duration,
    /// First backoff between reconnection polls.
    pub base_backoff: Duration,
    /// Added to the backoff once per attempt (scaled by the attempt number).
    pub backoff_step: Duration,
    /// Reconnection polls tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// PING/PONG round trips tolerated before giving up.
    pub max_keepalive_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_close_delay: Duration::from_secs(5),
            base_backoff: Duration::from_millis(5500),
            backoff_step: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            max_keepalive_retries: 5,
        }
    }
}

/// What one opened connection yielded.
enum Reply {
    /// A decoded response body.
    Body(Value),
    /// The server answered with a keepalive; retry on a fresh connection.
    Keepalive,
    /// The channel recovered after a closed signal; retry the request.
    Retry,
}

/// A caller for a courier IPC server.
///
/// Stateless across calls; cheap to construct and to share behind a
/// reference.
#[derive(Debug, Clone)]
pub struct ClientSession {
    config: ClientConfig,
    retry: RetryPolicy,
}

impl ClientSession {
    /// Create a session with the reference retry schedule.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
        }
    }

    /// Create a session with a custom retry schedule.
    #[must_use]
    pub fn with_retry_policy(config: ClientConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    /// The port this session connects to: the configured primary port, or
    /// the multicast port when none was provided.
    #[must_use]
    pub fn resolved_port(&self) -> u16 {
        self.config.port.unwrap_or(self.config.multicast_port)
    }

    /// The secret key sent on the `Authorization` header, or `None`.
    #[must_use]
    pub fn secret_key(&self) -> Option<&str> {
        self.config.secret_key.as_deref()
    }

    /// The WebSocket URL this session connects to.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.config.host, self.resolved_port())
    }

    /// Make a request to the IPC server.
    ///
    /// Sends one frame targeting `route` with `data` as call arguments and
    /// returns the decoded reply body — protocol error replies included, as
    /// the server encodes them as ordinary bodies.
    ///
    /// # Errors
    ///
    /// [`IpcError::ServerDisconnected`] after the reconnection budget is
    /// exhausted, [`IpcError::KeepaliveExceeded`] after the keepalive budget
    /// is, and transport or serialization failures as they occur.
    pub async fn request(
        &self,
        route: &str,
        data: Map<String, Value>,
    ) -> Result<Value, IpcError> {
        let url = self.url();

        let mut headers = Map::new();
        headers.insert(
            "Authorization".to_string(),
            match &self.config.secret_key {
                Some(secret) => Value::String(secret.clone()),
                None => Value::Null,
            },
        );
        let payload = CallFrame {
            endpoint: Some(route.to_string()),
            data: Some(data),
            headers: Some(headers),
        };
        let text = codec::encode(&payload)?;

        let mut keepalive_retries: u32 = 0;
        loop {
            let (mut ws, _response) = connect_async(url.as_str()).await?;
            debug!(payload = %text, "Session ->");
            ws.send(Message::Text(text.clone())).await?;

            let outcome = self.await_reply(&mut ws).await;
            // Release the connection on every exit path before acting on the
            // outcome.
            let _ = ws.close(None).await;

            match outcome? {
                Reply::Body(value) => return Ok(value),
                Reply::Retry => continue,
                Reply::Keepalive => {
                    keepalive_retries += 1;
                    if keepalive_retries > self.retry.max_keepalive_retries {
                        return Err(IpcError::KeepaliveExceeded {
                            retries: keepalive_retries,
                        });
                    }
                }
            }
        }
    }

    /// Await exactly one meaningful inbound frame on an open connection.
    async fn await_reply(&self, ws: &mut WsStream) -> Result<Reply, IpcError> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(body))) => {
                    debug!("Received a PING frame");
                    ws.send(Message::Pong(body)).await?;
                    debug!("Sent a PONG frame, retrying request");
                    return Ok(Reply::Keepalive);
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received a PONG frame, retrying request");
                    return Ok(Reply::Keepalive);
                }
                Some(Ok(Message::Text(body))) => {
                    debug!(payload = %body, "Session <-");
                    return Ok(Reply::Body(codec::decode(&body)?));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let body = String::from_utf8(bytes)
                        .map_err(|e| IpcError::WebSocket(e.to_string()))?;
                    debug!(payload = %body, "Session <-");
                    return Ok(Reply::Body(codec::decode(&body)?));
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.into_owned());
                    return self.reconnect(ws, reason).await;
                }
                Some(Err(e)) => {
                    // Abrupt closure without a close handshake counts as a
                    // closed channel.
                    warn!(error = %e, "WebSocket receive failed, treating as closed");
                    return self.reconnect(ws, Some(e.to_string())).await;
                }
                None => return self.reconnect(ws, None).await,
            }
        }
    }

    /// Bounded reconnection loop entered once the channel reports closed.
    async fn reconnect(&self, ws: &mut WsStream, reason: Option<String>) -> Result<Reply, IpcError> {
        error!(
            "WebSocket connection was closed: IPC server is unreachable. \
             Attempting reconnection in {:?}. Make sure the IPC server is \
             available and the host and port values are correct.",
            self.retry.initial_close_delay
        );
        tokio::time::sleep(self.retry.initial_close_delay).await;

        let mut backoff = self.retry.base_backoff;
        let mut attempts: u32 = 0;
        loop {
            let recovered = matches!(
                ws.next().await,
                Some(Ok(ref message)) if !matches!(message, Message::Close(_))
            );
            if recovered {
                info!("Successfully reconnected to IPC server. Retrying request");
                return Ok(Reply::Retry);
            }

            debug!(backoff = ?backoff, "WebSocket reconnection failed, retrying");
            tokio::time::sleep(backoff).await;
            attempts += 1;
            if attempts > self.retry.max_reconnect_attempts {
                return Err(IpcError::ServerDisconnected { attempts, reason });
            }
            backoff += self.retry.backoff_step * attempts;
        }
    }
}
