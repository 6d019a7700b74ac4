//! Built-in Routes
//!
//! The small route set every daemon instance exposes: liveness, echo, and a
//! status summary. Hosting processes embedding `courier-core` directly will
//! register their own routes instead.

use std::time::Instant;

use serde_json::{json, Map, Value};

use courier_core::{IpcError, Request, Server};

/// Register the daemon's built-in routes.
pub fn register_builtin(server: &mut Server) -> Result<(), IpcError> {
    server.route("/ping", |req: Request| async move {
        req.respond(&json!({"pong": true})).await?;
        Ok(())
    })?;

    server.route("/echo", |req: Request| async move {
        let data: Map<String, Value> = req
            .items()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        req.respond(&Value::Object(data)).await?;
        Ok(())
    })?;

    let started = Instant::now();
    server.route("/status", move |req: Request| {
        let uptime = started.elapsed();
        async move {
            req.respond(&json!({
                "code": 200,
                "uptime_secs": uptime.as_secs(),
            }))
            .await?;
            Ok(())
        }
    })?;

    Ok(())
}
