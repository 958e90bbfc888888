use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::message::OutboundMessage;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CourierParams {
    #[serde(default)]
    pub courier_id: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrackParams {
    #[serde(default)]
    pub order_id: Option<String>,
}

fn upgrade_required() -> Response {
    AppError::BadRequest("websocket upgrade required".to_string()).into_response()
}

/// Courier live connection. The token is checked before the upgrade.
pub async fn courier_ws(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CourierParams>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    if params.courier_id.is_empty() {
        return Err(AppError::Unauthorized);
    }
    state.verifier.verify(&params.token, &params.courier_id)?;

    let Some(ws) = ws else {
        return Ok(upgrade_required());
    };

    let courier_id = params.courier_id;
    Ok(ws.on_upgrade(move |socket| handle_courier_socket(socket, state, courier_id)))
}

async fn handle_courier_socket(socket: WebSocket, state: Arc<AppState>, courier_id: String) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let session_id = state.sessions.open(&courier_id, tx);

    let mut send_task = tokio::spawn(forward_outbound(sender, rx));

    let sessions = state.sessions.clone();
    let reader_id = courier_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => sessions.on_inbound_text(&reader_id, &text),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.sessions.close(&courier_id, session_id);
}

/// Customer tracking subscription for one order.
pub async fn track_ws(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrackParams>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    let order_id = params
        .order_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("order_id is required".to_string()))?;

    let Some(ws) = ws else {
        return Ok(upgrade_required());
    };

    Ok(ws.on_upgrade(move |socket| handle_tracking_socket(socket, state, order_id)))
}

async fn handle_tracking_socket(socket: WebSocket, state: Arc<AppState>, order_id: String) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber_id = state.sessions.subscribe_tracking(&order_id, tx);

    info!(order_id = %order_id, "tracking client connected");

    let mut send_task = tokio::spawn(forward_outbound(sender, rx));
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.sessions.unsubscribe_tracking(&order_id, subscriber_id);
    info!(order_id = %order_id, "tracking client disconnected");
}

/// Live feed of dispatch events.
pub async fn events_ws(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_events_socket(socket, state)),
        None => upgrade_required(),
    }
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());

    info!("event stream client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream client lagging");
                    continue;
                }
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("event stream client disconnected");
}

async fn forward_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound message");
                continue;
            }
        };

        if sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}
