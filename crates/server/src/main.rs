use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::SocketId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

mod config;
mod hub;
mod store;

use config::load_settings;
use hub::{Hub, Reply};
use store::MemoryMessageStore;

/// Frames queued for one connection's writer task. `Close` makes the writer
/// hang up, which is how kicks are enforced.
enum OutboundFrame {
    Event(ServerEvent),
    Close,
}

struct AppState {
    hub: Mutex<Hub>,
    outboxes: Mutex<HashMap<SocketId, mpsc::UnboundedSender<OutboundFrame>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let store = Arc::new(MemoryMessageStore::new());
    let state = Arc::new(AppState {
        hub: Mutex::new(Hub::new(store)),
        outboxes: Mutex::new(HashMap::new()),
    });
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;

    let socket_id = SocketId(Uuid::new_v4().to_string());
    let (mut writer, mut reader) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    state
        .outboxes
        .lock()
        .await
        .insert(socket_id.clone(), outbox);
    info!(socket = %socket_id, "client connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            match frame {
                OutboundFrame::Event(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if writer.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(frame)) = reader.next().await {
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => {
                    let reply = {
                        let mut hub = state.hub.lock().await;
                        hub.handle_request(&socket_id, request).await
                    };
                    deliver(&state, reply).await;
                }
                Err(err) => {
                    warn!(socket = %socket_id, %err, "ignoring malformed client frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.outboxes.lock().await.remove(&socket_id);
    let reply = {
        let mut hub = state.hub.lock().await;
        hub.handle_disconnect(&socket_id).await
    };
    deliver(&state, reply).await;
    send_task.abort();
    info!(socket = %socket_id, "client disconnected");
}

async fn deliver(state: &Arc<AppState>, reply: Reply) {
    let outboxes = state.outboxes.lock().await;
    for (socket, event) in reply.sends {
        if let Some(outbox) = outboxes.get(&socket) {
            let _ = outbox.send(OutboundFrame::Event(event));
        }
    }
    for socket in reply.closes {
        if let Some(outbox) = outboxes.get(&socket) {
            let _ = outbox.send(OutboundFrame::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            hub: Mutex::new(Hub::new(Arc::new(MemoryMessageStore::new()))),
            outboxes: Mutex::new(HashMap::new()),
        })
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_requires_an_upgrade() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_ne!(response.status(), axum::http::StatusCode::OK);
    }
}
