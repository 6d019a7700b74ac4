//! End-to-end tests over real sockets.
//!
//! Every test binds port 0 and resolves the actual port from the server, so
//! suites can run in parallel. Scenarios cover the happy path, the protocol
//! error table, discovery, lifecycle notifications, and the client's retry
//! behavior against misbehaving peers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use courier_core::{
    ClientConfig, ClientSession, EndpointKind, IpcError, IpcEvent, Request, RetryPolicy, Server,
    ServerConfig,
};

const SECRET: &str = "test-secret";

fn server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: Some(SECRET.to_string()),
        multicast: true,
        multicast_port: 0,
    }
}

/// Build, set up, and start a server; returns the resolved ports.
async fn spawn_server(
    register: impl FnOnce(&mut Server),
) -> (Server, mpsc::UnboundedReceiver<IpcEvent>, u16, u16) {
    let (events, rx) = mpsc::unbounded_channel();
    let mut server = Server::new(server_config(), events);
    register(&mut server);
    server.setup();
    server.start().await.unwrap();
    let primary = server.local_addr(EndpointKind::Primary).unwrap().port();
    let multicast = server.local_addr(EndpointKind::Multicast).unwrap().port();
    (server, rx, primary, multicast)
}

fn client_for(port: u16, secret: Option<&str>) -> ClientSession {
    ClientSession::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        port: Some(port),
        multicast_port: 20000,
        secret_key: secret.map(String::from),
    })
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_close_delay: Duration::from_millis(10),
        base_backoff: Duration::from_millis(5),
        backoff_step: Duration::from_millis(1),
        max_reconnect_attempts: 5,
        max_keepalive_retries: 5,
    }
}

fn register_ping(server: &mut Server) {
    server
        .route("/ping", |req: Request| async move {
            req.respond(&json!({"pong": true})).await?;
            Ok(())
        })
        .unwrap();
}

/// Send one raw frame and read one text reply.
async fn raw_call(port: u16, payload: Value) -> Value {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    ws.send(Message::Text(payload.to_string())).await.unwrap();
    let reply = loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            Message::Text(text) => break text,
            _ => continue,
        }
    };
    let _ = ws.close(None).await;
    serde_json::from_str(&reply).unwrap()
}

#[tokio::test]
async fn test_scenario_a_ping_roundtrip() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let client = client_for(primary, Some(SECRET));
    let reply = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn test_scenario_b_wrong_secret_is_403() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let client = client_for(primary, Some("wrong"));
    let reply = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"error": "Unauthorized", "code": 403}));
}

#[tokio::test]
async fn test_scenario_c_unknown_route_is_400() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let client = client_for(primary, Some(SECRET));
    let reply = timeout(Duration::from_secs(5), client.request("/missing", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"error": "Invalid endpoint provided", "code": 400}));
}

#[tokio::test]
async fn test_scenario_d_multicast_discovery() {
    let (_server, _rx, primary, multicast) = spawn_server(register_ping).await;

    // No primary port configured: the session resolves to the multicast port.
    let session = ClientSession::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        port: None,
        multicast_port: multicast,
        secret_key: Some(SECRET.to_string()),
    });
    let reply = timeout(Duration::from_secs(5), session.request("/any", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reply,
        json!({"message": "Successfully connected", "code": 200, "port": primary})
    );

    // The advertised port serves the real session.
    let client = client_for(primary, Some(SECRET));
    let reply = client.request("/ping", Map::new()).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn test_missing_endpoint_is_401() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let reply = raw_call(primary, json!({"data": {}})).await;
    assert_eq!(reply, json!({"error": "No endpoint was set", "code": 401}));
}

#[tokio::test]
async fn test_missing_authorization_is_401_on_primary() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let reply = raw_call(primary, json!({"endpoint": "/ping"})).await;
    assert_eq!(reply, json!({"error": "Unauthorized", "code": 401}));

    let reply = raw_call(primary, json!({"endpoint": "/ping", "headers": {}})).await;
    assert_eq!(reply, json!({"error": "Unauthorized", "code": 401}));
}

#[tokio::test]
async fn test_missing_authorization_is_403_on_multicast() {
    let (_server, _rx, _, multicast) = spawn_server(register_ping).await;

    // Missing and wrong keys both map to 403 on the discovery endpoint.
    let reply = raw_call(multicast, json!({"headers": {}})).await;
    assert_eq!(reply, json!({"error": "Unauthorized", "code": 403}));

    let reply = raw_call(multicast, json!({"headers": {"Authorization": "wrong"}})).await;
    assert_eq!(reply, json!({"error": "Unauthorized", "code": 403}));
}

#[tokio::test]
async fn test_violation_ends_connection_processing() {
    let (_server, _rx, primary, _) = spawn_server(register_ping).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{primary}")).await.unwrap();
    ws.send(Message::Text(
        json!({"endpoint": "/ping", "headers": {"Authorization": "wrong"}}).to_string(),
    ))
    .await
    .unwrap();

    // First the error reply, then the server stops serving this connection.
    let mut got_error = false;
    let mut closed = false;
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["code"], 403);
                got_error = true;
            }
            Ok(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => {
                closed = true;
                break;
            }
            Ok(Some(Ok(_))) => {}
            Err(_) => break,
        }
    }
    assert!(got_error, "error reply must be delivered before the close");
    assert!(closed, "one bad frame ends the connection");
}

#[tokio::test]
async fn test_route_receives_call_arguments() {
    let (_server, _rx, primary, _) = spawn_server(|server| {
        server
            .route("/echo", |req: Request| async move {
                req.respond(&json!({"value": req.get("value")})).await?;
                Ok(())
            })
            .unwrap();
    })
    .await;

    let client = client_for(primary, Some(SECRET));
    let mut data = Map::new();
    data.insert("value".to_string(), json!("hello"));
    let reply = client.request("/echo", data).await.unwrap();
    assert_eq!(reply, json!({"value": "hello"}));
}

#[tokio::test]
async fn test_lifecycle_events_bracket_the_handler() {
    let (_server, mut rx, primary, _) = spawn_server(register_ping).await;

    let client = client_for(primary, Some(SECRET));
    client.request("/ping", Map::new()).await.unwrap();

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    match first {
        IpcEvent::RawRequest(request) => assert_eq!(request.endpoint(), "/ping"),
        IpcEvent::RequestCompletion(_) => panic!("RawRequest must fire first"),
    }

    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    match second {
        IpcEvent::RequestCompletion(request) => {
            assert_eq!(request.endpoint(), "/ping");
            assert!(request.is_done());
        }
        IpcEvent::RawRequest(_) => panic!("completion must fire after the handler"),
    }
}

#[tokio::test]
async fn test_frames_on_one_connection_are_serial() {
    let (_server, _rx, primary, _) = spawn_server(|server| {
        server
            .route("/slow", |req: Request| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                req.respond(&json!({"which": "slow"})).await?;
                Ok(())
            })
            .unwrap();
        server
            .route("/fast", |req: Request| async move {
                req.respond(&json!({"which": "fast"})).await?;
                Ok(())
            })
            .unwrap();
    })
    .await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{primary}")).await.unwrap();
    for endpoint in ["/slow", "/fast"] {
        ws.send(Message::Text(
            json!({
                "endpoint": endpoint,
                "data": {},
                "headers": {"Authorization": SECRET},
            })
            .to_string(),
        ))
        .await
        .unwrap();
    }

    let mut order = Vec::new();
    while order.len() < 2 {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            Message::Text(text) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                order.push(reply["which"].as_str().unwrap().to_string());
            }
            _ => {}
        }
    }
    assert_eq!(order, vec!["slow", "fast"], "arrival order must be preserved");
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn test_respond_after_disconnect_poisons_the_slot() {
    let (req_tx, mut req_rx) = mpsc::unbounded_channel();
    let (_server, _rx, primary, _) = spawn_server(move |server| {
        server
            .route("/defer", move |req| {
                let req_tx = req_tx.clone();
                async move {
                    // Hand the request off to be answered elsewhere.
                    req_tx.send(req).ok();
                    Ok(())
                }
            })
            .unwrap();
    })
    .await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{primary}")).await.unwrap();
    ws.send(Message::Text(
        json!({"endpoint": "/defer", "data": {}, "headers": {"Authorization": SECRET}}).to_string(),
    ))
    .await
    .unwrap();

    let request = timeout(Duration::from_secs(2), req_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!request.is_done());

    // The caller vanishes before the response is sent.
    let _ = ws.close(None).await;
    drop(ws);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The handler-facing call still succeeds; the failure lands in the slot.
    request.respond(&json!({"late": true})).await.unwrap();
    assert!(request.is_done());
    assert!(request.wait_until_done().await.is_err());

    let second = request.respond(&json!({"late": true})).await;
    assert!(matches!(second, Err(IpcError::AlreadyResponded)));
}

/// A raw WebSocket server that answers the first `keepalives` request frames
/// with a PING and every later one with a real body.
async fn keepalive_server(keepalives: usize) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let connections_for_loop = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = connections_for_loop.fetch_add(1, Ordering::SeqCst);
            let answer = seen >= keepalives;
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) => {
                            let reply = if answer {
                                Message::Text(json!({"ok": true}).to_string())
                            } else {
                                Message::Ping(Vec::new())
                            };
                            if ws.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (port, connections)
}

#[tokio::test]
async fn test_client_retries_through_keepalives() {
    let (port, connections) = keepalive_server(2).await;

    let client = ClientSession::with_retry_policy(
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: Some(port),
            multicast_port: 20000,
            secret_key: Some(SECRET.to_string()),
        },
        fast_retry(),
    );

    let reply = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"ok": true}));
    assert_eq!(connections.load(Ordering::SeqCst), 3, "one connection per retry");
}

#[tokio::test]
async fn test_client_gives_up_on_endless_keepalives() {
    let (port, _connections) = keepalive_server(usize::MAX).await;

    let client = ClientSession::with_retry_policy(
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: Some(port),
            multicast_port: 20000,
            secret_key: Some(SECRET.to_string()),
        },
        fast_retry(),
    );

    let result = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(IpcError::KeepaliveExceeded { .. })));
}

#[tokio::test]
async fn test_client_exhausts_reconnection_budget_on_closed_channel() {
    // A server that closes every connection as soon as the request arrives.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let _ = ws.next().await;
                let _ = ws.close(None).await;
            });
        }
    });

    let client = ClientSession::with_retry_policy(
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: Some(port),
            multicast_port: 20000,
            secret_key: Some(SECRET.to_string()),
        },
        fast_retry(),
    );

    let result = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap();
    match result {
        Err(IpcError::ServerDisconnected { attempts, .. }) => assert_eq!(attempts, 6),
        other => panic!("expected ServerDisconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_error_ends_connection_without_reply() {
    let (_server, _rx, primary, _) = spawn_server(|server| {
        register_ping(server);
        server
            .route("/fail", |_req| async move {
                Err(IpcError::Config("handler blew up".to_string()))
            })
            .unwrap();
    })
    .await;

    // The failed call never gets a body; the client sees a closed channel.
    let client = ClientSession::with_retry_policy(
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: Some(primary),
            multicast_port: 20000,
            secret_key: Some(SECRET.to_string()),
        },
        fast_retry(),
    );
    let result = timeout(Duration::from_secs(5), client.request("/fail", Map::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(IpcError::ServerDisconnected { .. })));

    // The server survives: later calls on fresh connections still work.
    let reply = timeout(Duration::from_secs(5), client.request("/ping", Map::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn test_multicast_serves_repeated_discovery_frames() {
    let (_server, _rx, primary, multicast) = spawn_server(register_ping).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{multicast}")).await.unwrap();
    for _ in 0..2 {
        ws.send(Message::Text(
            json!({"headers": {"Authorization": SECRET}}).to_string(),
        ))
        .await
        .unwrap();
        let reply = loop {
            match timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
            {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["port"], json!(primary));
    }
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn test_terminate_stops_serving() {
    let (mut server, _rx, primary, _) = spawn_server(register_ping).await;

    server.terminate().await.unwrap();
    let result = connect_async(format!("ws://127.0.0.1:{primary}")).await;
    assert!(result.is_err(), "terminated server must not accept connections");
}
