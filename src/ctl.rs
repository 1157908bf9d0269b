/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Control socket
//!
//! Line-framed JSON over a Unix socket: each line is one
//! `{"name": ..., "data": ..., "reply": bool}` message. Commands with
//! `reply` set get exactly one response line carrying the same name.
//! Unsolicited event broadcasts (endpoint changes) go to every connected
//! client. Nothing here can fail the serving path; a broken client is
//! just disconnected.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub reply: bool,
}

pub type CommandHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Value> + Send>> + Send + Sync>;

pub struct ControlSocket {
    path: PathBuf,
    handlers: HashMap<String, CommandHandler>,
    events: broadcast::Sender<ControlMessage>,
}

impl ControlSocket {
    pub fn new(path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            path,
            handlers: HashMap::new(),
            events,
        }
    }

    /// Register a command; call before `start`
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.handlers
            .insert(name.to_string(), Arc::new(move |v| Box::pin(handler(v))));
    }

    /// Push an event to every connected client
    pub fn broadcast(&self, name: &str, data: Value) {
        let _ = self.events.send(ControlMessage {
            name: name.to_string(),
            data,
            reply: false,
        });
    }

    /// Bind the socket and serve clients until shutdown
    pub fn start(self: &Arc<Self>) -> Result<()> {
        // A stale socket from a previous run would make bind fail
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "control socket listening");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            this.serve_client(stream).await;
                        });
                    }
                    Err(e) => debug!(error = %e, "control accept failed"),
                }
            }
        });
        Ok(())
    }

    async fn serve_client(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message: ControlMessage = match serde_json::from_str(&line) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "unparseable control message");
                            continue;
                        }
                    };
                    let response = self.dispatch(message).await;
                    if let Some(response) = response {
                        if write_line(&mut write_half, &response).await.is_err() {
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if write_line(&mut write_half, &event).await.is_err() {
                                break;
                            }
                        }
                        // Slow client missed events; keep serving
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: ControlMessage) -> Option<ControlMessage> {
        let data = match self.handlers.get(&message.name) {
            Some(handler) => handler(message.data).await,
            None => {
                warn!(name = %message.name, "unknown control command");
                json!({ "error": format!("unknown command: {}", message.name) })
            }
        };
        if !message.reply {
            return None;
        }
        Some(ControlMessage {
            name: message.name,
            data,
            reply: false,
        })
    }
}

async fn write_line(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    message: &ControlMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(message).unwrap_or_default();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket(path: PathBuf) -> Arc<ControlSocket> {
        let mut ctl = ControlSocket::new(path);
        ctl.register("echo", |data| async move { data });
        Arc::new(ctl)
    }

    #[tokio::test]
    async fn commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctl = test_socket(path.clone());
        ctl.start().unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"name\":\"echo\",\"data\":{\"x\":1},\"reply\":true}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: ControlMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(reply.name, "echo");
        assert_eq!(reply.data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_command_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctl = test_socket(path.clone());
        ctl.start().unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"name\":\"nope\",\"reply\":true}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: ControlMessage = serde_json::from_str(&line).unwrap();
        assert!(reply.data["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn events_reach_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctl = test_socket(path.clone());
        ctl.start().unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Give the accept loop a moment to subscribe the client
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctl.broadcast("endpoint-changed", json!({"endpoint": "https://dns.example/q"}));

        let line = lines.next_line().await.unwrap().unwrap();
        let event: ControlMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(event.name, "endpoint-changed");
    }
}
