//! WebSocket handler streaming watch events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tracing::debug;

use super::handlers::AppState;
use super::types::{WatchKind, WatchQuery, WsMessage};
use crate::error::CoordError;
use crate::session::ConnectionState;
use crate::watch::{ChildrenWatch, NodeWatch, TreeWatch, WatchEvents};

/// WebSocket upgrade handler for `/api/v1/watch/{*path}`.
pub async fn watch_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<WatchQuery>,
) -> impl IntoResponse {
    let path = format!("/{}", path.trim_start_matches('/'));
    ws.on_upgrade(move |socket| handle_socket(socket, state, path, query))
}

/// WebSocket upgrade handler for watching the root.
pub async fn watch_root_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, "/".to_string(), query))
}

/// Keeps the watch registered for as long as the socket is served.
enum ActiveWatch {
    Node(NodeWatch),
    Children(ChildrenWatch),
    Tree(TreeWatch),
}

impl ActiveWatch {
    async fn open(
        state: &AppState,
        path: &str,
        query: WatchQuery,
    ) -> crate::Result<(Self, WatchEvents)> {
        let (watch, events) = match query.kind {
            WatchKind::Node => {
                let (w, rx) = NodeWatch::new(&state.session, path)?;
                (ActiveWatch::Node(w), rx)
            }
            WatchKind::Children => {
                let (w, rx) = ChildrenWatch::new(&state.session, path)?;
                (ActiveWatch::Children(w), rx)
            }
            WatchKind::Tree => {
                let (w, rx) = TreeWatch::new(&state.session, path)?;
                (ActiveWatch::Tree(w), rx)
            }
        };
        match &watch {
            ActiveWatch::Node(w) => w.start(query.load_initial).await?,
            ActiveWatch::Children(w) => w.start(query.load_initial).await?,
            ActiveWatch::Tree(w) => w.start(query.load_initial).await?,
        }
        Ok((watch, events))
    }

    fn stop(&self) {
        match self {
            ActiveWatch::Node(w) => w.stop(),
            ActiveWatch::Children(w) => w.stop(),
            ActiveWatch::Tree(w) => w.stop(),
        }
    }
}

async fn send_json<T: Serialize>(sink: &mut SplitSink<WebSocket, Message>, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

fn error_message(err: &CoordError) -> WsMessage {
    WsMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, path: String, query: WatchQuery) {
    let (mut sink, mut stream) = socket.split();

    let (watch, mut events) = match ActiveWatch::open(&state, &path, query).await {
        Ok(opened) => opened,
        Err(e) => {
            let _ = send_json(&mut sink, &error_message(&e)).await;
            return;
        }
    };
    debug!("streaming {:?} watch on {}", query.kind, path);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    let reason = match state.session.state() {
                        ConnectionState::Expired => CoordError::SessionExpired,
                        _ => CoordError::SessionClosed,
                    };
                    let _ = send_json(&mut sink, &error_message(&reason)).await;
                    break;
                };
                if !send_json(&mut sink, &event).await {
                    break;
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Ping) => {
                        let _ = send_json(&mut sink, &WsMessage::Pong).await;
                    }
                    Ok(WsMessage::Stop) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let err = WsMessage::Error {
                            code: "PARSE_ERROR".to_string(),
                            message: e.to_string(),
                        };
                        let _ = send_json(&mut sink, &err).await;
                    }
                }
            }
        }
    }

    watch.stop();
    debug!("watch stream on {} ended", path);
}
