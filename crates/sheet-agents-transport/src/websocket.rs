//! WebSocket transport: one socket is one session.

use std::fmt::Display;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use sheet_agents_session::Controller;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub controller: Controller,
}

impl WsState {
    #[must_use]
    pub const fn new(controller: Controller) -> Self {
        Self { controller }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.controller))
}

async fn handle_socket(socket: WebSocket, controller: Controller) {
    let (sender, receiver) = socket.split();
    serve_session(controller, sender, receiver).await;
}

/// Bind a socket's frame sink and stream to a new session until either side
/// goes away.
///
/// Inbound frames are dispatched in arrival order. A close frame, a socket
/// error or a dispatch failure tears the session down.
pub async fn serve_session<Tx, Rx, E>(controller: Controller, mut sender: Tx, mut receiver: Rx)
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let handle = match controller.create_context() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("Rejecting WebSocket: {e}");
            let frame = ServerMessage::Error {
                request_id: None,
                message: e.to_string(),
            };
            if let Ok(json) = frame.encode() {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = handle.id;

    // Control frames for this connection (pong, decode errors)
    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _ = tx.send(ServerMessage::SessionStarted { session_id });

    let events = handle.events.into_stream().map(ServerMessage::Event);
    let mut outgoing = futures::stream::select(UnboundedReceiverStream::new(rx), events);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outgoing.next().await {
            let json = match msg.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    tracing::info!("WebSocket bound to session {session_id}");

    while let Some(msg) = receiver.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => ClientMessage::decode(text.as_str()),
            Ok(Message::Binary(data)) => ClientMessage::decode_binary(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("WebSocket error on session {session_id}: {e}");
                break;
            }
        };

        match decoded {
            Ok(ClientMessage::Ping) => {
                let _ = tx.send(ServerMessage::Pong);
            }
            Ok(ClientMessage::Command(envelope)) => {
                if let Err(e) = controller.dispatch(session_id, envelope) {
                    tracing::warn!("Dropping connection: {e}");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Invalid client message on session {session_id}: {e}");
                let _ = tx.send(ServerMessage::error(&e));
            }
        }
    }

    drop(tx);
    if let Err(e) = controller.teardown_context(session_id, "client disconnected") {
        tracing::debug!("Teardown of session {session_id}: {e}");
    }
    if let Err(e) = send_task.await {
        tracing::error!("Send task for session {session_id} failed: {e}");
    }
    tracing::info!("WebSocket for session {session_id} disconnected");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(controller));
/// ```
#[must_use]
pub fn create_ws_router(controller: Controller) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(controller))
}
