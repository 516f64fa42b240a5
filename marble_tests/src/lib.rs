//! Test support: a scripted WebSocket server.
//!
//! Integration tests need the server side of the wire without a real
//! game server. [`ScriptedServer`] accepts connections on an ephemeral
//! loopback port and hands each one to the test as a pair of channels:
//! text frames read from the client, and frames the test wants
//! delivered. Dropping a [`ServerConn`] closes its socket, which the
//! client under test sees as the peer vanishing.

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use marble_shared::config::{ClientConfig, InterpSpeeds};

/// One accepted client connection, driven by the test.
pub struct ServerConn {
    /// Text frames received from the client, in arrival order.
    pub incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ServerConn {
    /// Waits for the next client text frame.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Waits for the next client frame, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Next client frame without waiting, if one already arrived.
    pub fn poll_text(&mut self) -> Option<String> {
        self.incoming.try_recv().ok()
    }

    /// Queues a text frame for delivery to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.outgoing.send(Message::Text(text.into()));
    }

    /// Queues a close frame with the given code.
    pub fn close(&self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.outgoing.send(Message::Close(Some(frame)));
    }
}

/// Accepts WebSocket connections and surfaces them one by one.
pub struct ScriptedServer {
    pub url: String,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl ScriptedServer {
    /// Binds an ephemeral loopback port and starts accepting.
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind")?;
        let addr = listener.local_addr().context("local_addr")?;
        let (conn_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "scripted server accepted");
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = ws.split();
                    let (in_tx, incoming) = mpsc::unbounded_channel();
                    let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
                    if conn_tx.send(ServerConn { incoming, outgoing }).is_err() {
                        return;
                    }

                    let writer = tokio::spawn(async move {
                        while let Some(msg) = out_rx.recv().await {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        // The test dropped its handle; take the socket
                        // down so the client notices.
                        let _ = sink.close().await;
                    });

                    while let Some(Ok(msg)) = stream.next().await {
                        match msg {
                            Message::Text(text) => {
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    writer.abort();
                });
            }
        });

        Ok(Self {
            url: format!("ws://{addr}"),
            conns,
        })
    }

    /// Waits up to `window` for the next client connection.
    pub async fn accept_within(&mut self, window: Duration) -> Option<ServerConn> {
        tokio::time::timeout(window, self.conns.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next connection without waiting, if one already arrived.
    pub fn poll_accept(&mut self) -> Option<ServerConn> {
        self.conns.try_recv().ok()
    }
}

/// Client configuration pointed at the harness, with timings scaled for
/// tests. Heartbeat is effectively off unless a test lowers it.
pub fn test_config(url: &str) -> ClientConfig {
    ClientConfig {
        server_url: url.to_string(),
        heartbeat_secs: 10.0,
        heartbeat_grace: 2.5,
        reconnect_base_secs: 0.05,
        max_reconnect_attempts: 5,
        interp: InterpSpeeds::default(),
    }
}
