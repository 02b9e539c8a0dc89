//! In-process mock guiding engine for integration tests.
//!
//! Listens on an ephemeral TCP port and speaks the engine's newline-
//! delimited JSON protocol: every accepted connection can receive commands
//! (answered per configured responder) and, like the real engine, has all
//! events broadcast to it. Tests script behavior by configuring responders
//! and events to emit when a given method arrives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use guidelink::{Guider, GuiderConfig, SessionSnapshot};

/// How a mock engine answers one RPC method.
#[derive(Debug, Clone)]
pub enum Responder {
    /// Answer with the given result.
    Ok(serde_json::Value),
    /// Answer with an error payload (result still present, as the real
    /// engine does).
    Error { code: i64, message: String },
    /// Never answer; the connection stays open.
    Silent,
    /// Answer for an unrelated id first, then with the real result.
    OkAfterUnrelated(serde_json::Value),
    /// Drop the connection without answering.
    CloseConnection,
}

#[derive(Default)]
struct MockState {
    /// Method names in arrival order, across all connections.
    commands: Mutex<Vec<String>>,
    responders: Mutex<HashMap<String, Responder>>,
    /// Events to broadcast right after answering a given method.
    auto_events: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

/// Scripted engine double bound to an ephemeral local port.
pub struct MockEngine {
    port: u16,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockEngine {
    /// Binds and starts accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock engine");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(MockState::default());
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let conn_state = Arc::clone(&accept_state);
                            let conn_shutdown = accept_shutdown.clone();
                            tokio::spawn(handle_connection(stream, conn_state, conn_shutdown));
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Self {
            port,
            state,
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Baseline client profile pointing at this mock.
    pub fn config(&self) -> GuiderConfig {
        GuiderConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            executable: None,
            command_timeout_secs: 5,
            ..GuiderConfig::default()
        }
    }

    /// Configures the answer for one RPC method.
    pub fn respond(&self, method: &str, responder: Responder) {
        self.state
            .responders
            .lock()
            .expect("responders lock")
            .insert(method.to_string(), responder);
    }

    /// Broadcasts the given event right after answering `method`.
    pub fn emit_on(&self, method: &str, event: serde_json::Value) {
        self.state
            .auto_events
            .lock()
            .expect("auto_events lock")
            .entry(method.to_string())
            .or_default()
            .push(event);
    }

    /// Broadcasts one event to every open connection.
    pub fn send_event(&self, event: serde_json::Value) {
        broadcast(&self.state, &event);
    }

    /// Methods received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().expect("commands lock").clone()
    }

    /// Count of received commands with the given method name.
    pub fn command_count(&self, method: &str) -> usize {
        self.commands().iter().filter(|m| *m == method).count()
    }

    /// Polls until a command with the given method arrives.
    pub async fn wait_for_command(&self, method: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.command_count(method) > 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Closes every connection and stops accepting new ones.
    pub fn close_connections(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn broadcast(state: &MockState, event: &serde_json::Value) {
    let line = format!("{}\n", event);
    let mut subscribers = state.subscribers.lock().expect("subscribers lock");
    subscribers.retain(|tx| tx.send(line.clone()).is_ok());
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .subscribers
        .lock()
        .expect("subscribers lock")
        .push(tx);

    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(line) => {
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            item = lines.next() => match item {
                Some(Ok(line)) => {
                    if !handle_request(&line, &state, &mut write_half).await {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
}

/// Answers one request line. Returns false when the connection should drop.
async fn handle_request(line: &str, state: &Arc<MockState>, write: &mut OwnedWriteHalf) -> bool {
    let request: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return true,
    };
    let Some(method) = request["method"].as_str().map(String::from) else {
        return true;
    };
    let id = request["id"].as_str().unwrap_or(&method).to_string();

    state
        .commands
        .lock()
        .expect("commands lock")
        .push(method.clone());

    let responder = state
        .responders
        .lock()
        .expect("responders lock")
        .get(&method)
        .cloned()
        .unwrap_or(Responder::Ok(serde_json::json!(0)));

    let ok = match responder {
        Responder::Ok(result) => write_response(write, &id, Some(result), None).await,
        Responder::Error { code, message } => {
            write_response(
                write,
                &id,
                Some(serde_json::json!(0)),
                Some(serde_json::json!({"code": code, "message": message})),
            )
            .await
        }
        Responder::Silent => true,
        Responder::OkAfterUnrelated(result) => {
            write_response(write, "unrelated", Some(serde_json::json!("stale")), None).await
                && write_response(write, &id, Some(result), None).await
        }
        Responder::CloseConnection => false,
    };
    if !ok {
        return false;
    }

    let events = state
        .auto_events
        .lock()
        .expect("auto_events lock")
        .get(&method)
        .cloned()
        .unwrap_or_default();
    for event in events {
        broadcast(state, &event);
    }

    true
}

async fn write_response(
    write: &mut OwnedWriteHalf,
    id: &str,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
) -> bool {
    let response = serde_json::json!({
        "jsonrpc": "1.0",
        "id": id,
        "result": result,
        "error": error,
    });
    write
        .write_all(format!("{}\n", response).as_bytes())
        .await
        .is_ok()
}

/// Polls the guider's snapshot until `pred` holds or `timeout` elapses.
pub async fn wait_for_snapshot<F>(guider: &Guider, timeout: Duration, pred: F) -> bool
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred(&guider.snapshot().await) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
