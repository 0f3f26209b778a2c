//! Relay transport — one WebSocket per browser worker.

use std::sync::Arc;

use arenabridge_relay::Envelope;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Envelope>();
    let worker = state.registry.register(tx);

    loop {
        tokio::select! {
            // Registry -> browser
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                match envelope.to_json() {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            debug!("{} send failed, closing", worker);
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode command for {}: {}", worker, e),
                }
            }
            // Browser -> registry
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let routed = Envelope::parse(text.as_str())
                            .and_then(|env| state.registry.handle_incoming(worker, env));
                        if let Err(e) = routed {
                            warn!("Closing {}: {}", worker, e);
                            let frame = CloseFrame {
                                code: close_code::POLICY,
                                reason: "protocol violation".into(),
                            };
                            let _ = ws_tx.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Closing {}: binary frames are not part of the protocol", worker);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("{} socket error: {}", worker, e);
                        break;
                    }
                }
            }
        }
    }

    state.registry.unregister(worker);
}
