//! WebSocket server for streaming telemetry events to monitors
//!
//! Each client receives the current event history on connect, followed by
//! every event recorded afterwards.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::serialization::{self, Format};
use crate::telemetry::{lock_history, EventHistory};
use crate::{Error, Result};

/// Maximum size of the broadcast channel
const BROADCAST_CHANNEL_SIZE: usize = 1024;

/// WebSocket server for broadcasting telemetry events
pub struct WebSocketServer {
    /// Port to listen on
    port: u16,

    /// Broadcast channel for sending encoded frames to clients
    sender: broadcast::Sender<Vec<u8>>,

    /// Event history sent to clients on connect
    history: EventHistory,

    /// Encoding used for frames
    format: Format,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub(crate) fn new(port: u16, history: EventHistory, format: Format) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CHANNEL_SIZE);

        Self {
            port,
            sender,
            history,
            format,
        }
    }

    /// Bind to the configured port on localhost and serve clients
    pub async fn start(&self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        info!("Telemetry WebSocket server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve clients accepted from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(client) => client,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };

            debug!("New WebSocket connection from {}", addr);

            let receiver = self.sender.subscribe();
            let initial = match self.encode(&self.history_snapshot()) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Error encoding history for {}: {}", addr, e);
                    continue;
                }
            };

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(socket, addr, receiver, initial).await {
                    error!("Error handling WebSocket connection: {}", e);
                }
            });
        }
    }

    /// Handle a WebSocket connection
    async fn handle_connection(
        socket: TcpStream,
        addr: SocketAddr,
        mut receiver: broadcast::Receiver<Vec<u8>>,
        initial: Vec<u8>,
    ) -> Result<()> {
        let ws_stream = accept_async(socket)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(tokio::sync::Mutex::new(ws_sender));

        ws_sender
            .lock()
            .await
            .send(Message::Binary(initial))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let pong_sender = ws_sender.clone();

        // Handle incoming messages (ping/close)
        let client_task = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(msg) if msg.is_ping() => {
                        let mut lock = pong_sender.lock().await;
                        if let Err(e) = lock.send(Message::Pong(vec![])).await {
                            error!("Error sending pong: {}", e);
                            break;
                        }
                    }
                    Ok(msg) if msg.is_close() => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        break;
                    }
                }
            }

            debug!("WebSocket connection closed: {}", addr);
        });

        // Forward broadcast frames
        let broadcast_task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let mut lock = ws_sender.lock().await;
                        if let Err(e) = lock.send(Message::Binary(frame)).await {
                            error!("Error sending message: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("WebSocket client {} lagged, skipped {} frames", addr, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            debug!("WebSocket broadcast listener stopped: {}", addr);
        });

        tokio::select! {
            result = client_task => {
                if let Err(e) = result {
                    error!("Client task error: {}", e);
                }
            }
            result = broadcast_task => {
                if let Err(e) = result {
                    error!("Broadcast task error: {}", e);
                }
            }
        }

        debug!("WebSocket connection handler completed: {}", addr);
        Ok(())
    }

    /// Broadcast a message to all connected clients
    pub fn broadcast<T: Serialize>(&self, msg: &T) -> Result<()> {
        // Nothing to encode for when nobody listens
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }

        let frame = self.encode(msg)?;
        if let Err(e) = self.sender.send(frame) {
            debug!("Dropped telemetry frame: {}", e);
        }

        Ok(())
    }

    fn history_snapshot(&self) -> Vec<crate::telemetry::TelemetryEvent> {
        lock_history(&self.history).iter().cloned().collect()
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        serialization::encode(msg, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetryEvent, TelemetryEventKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn event(kind: TelemetryEventKind) -> TelemetryEvent {
        TelemetryEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            kind,
            store: Some("counter".to_string()),
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_client_receives_history_then_broadcasts() {
        let history: EventHistory = Arc::new(Mutex::new(VecDeque::from(vec![event(
            TelemetryEventKind::StoreCreated,
        )])));
        let server = Arc::new(WebSocketServer::new(0, history, Format::Json));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();

        let first = client.next().await.unwrap().unwrap();
        let events: Vec<TelemetryEvent> = serde_json::from_slice(&first.into_data()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TelemetryEventKind::StoreCreated);

        server.broadcast(&event(TelemetryEventKind::PersistFailed)).unwrap();

        let next = client.next().await.unwrap().unwrap();
        let event: TelemetryEvent = serde_json::from_slice(&next.into_data()).unwrap();
        assert_eq!(event.kind, TelemetryEventKind::PersistFailed);
    }
}
