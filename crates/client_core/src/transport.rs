use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Event(ServerEvent),
    /// An inbound frame that failed to parse. Surfaced as a notice upstream,
    /// never fatal to the connection.
    Malformed(String),
    Closed,
}

/// The realtime duplex channel. One instance per connection attempt; a fresh
/// `connect()` gets a fresh channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ClientRequest) -> Result<(), ClientError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    /// Forces a local close. Subscribers observe `Closed`.
    async fn close(&self);
}

/// Dials new channels, so a disconnected client can reconnect without being
/// handed a new transport from outside.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError>;
}

pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError> {
        let transport = WsTransport::connect(&self.server_url)
            .await
            .map_err(|err| ClientError::transport(format!("{err:#}")))?;
        Ok(transport as Arc<dyn Transport>)
    }
}

/// WebSocket transport: JSON text frames both ways. The reader task fans
/// parsed events out on a broadcast channel; writes are funneled through an
/// mpsc so `send` never blocks on the socket.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<TransportEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub async fn connect(server_url: &str) -> anyhow::Result<Arc<Self>> {
        let ws_url = websocket_url(server_url)?;
        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut writer, mut reader) = stream.split();
        let (events, _) = broadcast::channel(256);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                let _ = reader_events.send(TransportEvent::Event(event));
                            }
                            Err(err) => {
                                let _ =
                                    reader_events.send(TransportEvent::Malformed(err.to_string()));
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
            let _ = reader_events.send(TransportEvent::Closed);
        });

        Ok(Arc::new(Self {
            outbound,
            events,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, request: ClientRequest) -> Result<(), ClientError> {
        let text = serde_json::to_string(&request)
            .map_err(|err| ClientError::transport(format!("failed to encode request: {err}")))?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::transport("websocket is closed"))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

fn websocket_url(server_url: &str) -> anyhow::Result<Url> {
    let server_url = server_url.trim().trim_end_matches('/');
    let ws = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        format!("{server_url}/ws")
    } else {
        anyhow::bail!("server url must start with http:// or https://");
    };
    Url::parse(&ws).with_context(|| format!("invalid websocket url: {ws}"))
}
