//! WebSocket gateway
//!
//! Publishes normalized events to long-lived duplex clients. A client
//! sends `subscribe`/`unsubscribe` control frames carrying an `events`
//! list (topic names or `all`); every outbound frame is
//! `{type, payload, timestamp}` with 64-bit integers as strings. The
//! gateway also answers plain `GET /metrics`-style text requests on a
//! sibling port with the prometheus exposition.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::constants::GATEWAY_CLIENT_BUFFER;
use crate::event_router::{EventRouter, SubscriberHandle, TOPIC_ALL};
use crate::metrics;

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    events: Vec<String>,
}

pub struct WebSocketGateway {
    port: u16,
    router: Arc<EventRouter>,
    broadcast_tx: broadcast::Sender<(String, String)>,
}

impl WebSocketGateway {
    pub fn new(port: u16, router: Arc<EventRouter>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(GATEWAY_CLIENT_BUFFER);
        Self {
            port,
            router,
            broadcast_tx,
        }
    }

    /// Bind, bridge the router into the broadcast channel and serve
    /// clients until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("🌐 WebSocket gateway listening on {}", addr);
                listener
            }
            Err(e) => {
                error!("❌ Failed to bind gateway to {}: {}", addr, e);
                return Err(e.into());
            }
        };

        // Bridge: every routed event fans out to connected clients
        let broadcast_tx = self.broadcast_tx.clone();
        let _bridge: SubscriberHandle = self.router.subscribe(TOPIC_ALL, move |event| {
            let broadcast_tx = broadcast_tx.clone();
            Box::pin(async move {
                let frame = event.frame().to_string();
                // Send errors just mean no client is connected
                let _ = broadcast_tx.send((event.topic(), frame));
                Ok(())
            })
        });

        // Metrics sidecar on port + 1
        let metrics_port = self.port + 1;
        tokio::spawn(async move {
            if let Err(e) = run_metrics_endpoint(metrics_port).await {
                warn!("📊 Metrics endpoint stopped: {}", e);
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else {
                        continue;
                    };
                    let rx = self.broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, rx).await {
                            debug!("🌐 Client {} closed: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("🌐 Gateway shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    mut events: broadcast::Receiver<(String, String)>,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let mut subscriptions: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok((topic, frame)) => {
                        if wants(&subscriptions, &topic) {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("🌐 Slow gateway client dropped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            message = source.next() => {
                let Some(message) = message else {
                    return Ok(());
                };
                match message? {
                    Message::Text(text) => {
                        apply_control_frame(&text, &mut subscriptions);
                    }
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

fn apply_control_frame(text: &str, subscriptions: &mut HashSet<String>) {
    let Ok(frame) = serde_json::from_str::<ControlFrame>(text) else {
        debug!("🌐 Ignoring malformed control frame");
        return;
    };
    match frame.kind.as_str() {
        "subscribe" => {
            for event in frame.events {
                subscriptions.insert(event);
            }
        }
        "unsubscribe" => {
            for event in frame.events {
                subscriptions.remove(&event);
            }
        }
        other => debug!("🌐 Unknown control frame type {}", other),
    }
}

/// Topic match: exact, `all`, or a `prefix:*` wildcard subscription
fn wants(subscriptions: &HashSet<String>, topic: &str) -> bool {
    if subscriptions.contains(TOPIC_ALL) || subscriptions.contains(topic) {
        return true;
    }
    if let Some((prefix, _)) = topic.split_once(':') {
        return subscriptions.contains(&format!("{}:*", prefix));
    }
    false
}

/// Minimal HTTP responder for scrapers
async fn run_metrics_endpoint(port: u16) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("📊 Metrics endpoint on http://localhost:{}/metrics", port);
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            if stream.read(&mut buffer).await.is_ok() {
                let body = metrics::render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_subscribe_unsubscribe() {
        let mut subs = HashSet::new();
        apply_control_frame(
            r#"{"type":"subscribe","events":["bc:trade","token:graduated"]}"#,
            &mut subs,
        );
        assert!(subs.contains("bc:trade"));
        assert!(subs.contains("token:graduated"));

        apply_control_frame(r#"{"type":"unsubscribe","events":["bc:trade"]}"#, &mut subs);
        assert!(!subs.contains("bc:trade"));
    }

    #[test]
    fn test_wants_matching() {
        let mut subs = HashSet::new();
        subs.insert("bc:trade".to_string());
        assert!(wants(&subs, "bc:trade"));
        assert!(!wants(&subs, "amm:trade"));

        subs.insert("liquidity:*".to_string());
        assert!(wants(&subs, "liquidity:deposit"));
        assert!(wants(&subs, "liquidity:withdraw"));

        subs.clear();
        subs.insert(TOPIC_ALL.to_string());
        assert!(wants(&subs, "anything:at_all"));
    }

    #[test]
    fn test_malformed_control_frame_ignored() {
        let mut subs = HashSet::new();
        apply_control_frame("not json", &mut subs);
        assert!(subs.is_empty());
    }
}
