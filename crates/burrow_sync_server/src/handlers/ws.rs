//! WebSocket endpoint.
//!
//! Each connection runs one task: an authentication phase with a bounded
//! window, then a select loop over inbound frames and the session's outbound
//! event queue. All server events funnel through the queue, so delivery to a
//! given client is FIFO.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::TokenVerifier;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::sync::{ClientSession, SyncEngine};

/// Shared state for the WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub engine: Arc<SyncEngine>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub auth_timeout: Duration,
}

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_event(ws_tx: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("failed to serialize server event: {}", e);
            false
        }
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut session = ClientSession::new(tx);

    // Authentication must complete within a bounded window after connect.
    let authed = tokio::time::timeout(
        state.auth_timeout,
        authenticate(&mut session, &mut ws_rx, &mut ws_tx, &state),
    )
    .await;
    match authed {
        Ok(true) => {}
        Ok(false) => return,
        Err(_) => {
            send_event(&mut ws_tx, &ServerEvent::error("authentication timed out")).await;
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_event(&mut session, &state, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("socket error: {}", e);
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                // The session keeps a sender alive, so recv only yields Some.
                if let Some(event) = outbound {
                    if !send_event(&mut ws_tx, &event).await {
                        break;
                    }
                }
            }
        }
    }

    // Disconnect cancels pending sends and leaves the joined vault.
    state.engine.leave(&mut session).await;
    debug!(conn = %session.conn_id, "connection closed");
}

/// Wait for a valid `authenticate` event; anything else drops the connection.
async fn authenticate(
    session: &mut ClientSession,
    ws_rx: &mut SplitStream<WebSocket>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    state: &WsState,
) -> bool {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return false,
            Ok(_) => continue,
            Err(e) => {
                debug!("socket error before authentication: {}", e);
                return false;
            }
        };

        let event: ClientEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(_) => {
                send_event(ws_tx, &ServerEvent::error("malformed event")).await;
                return false;
            }
        };

        match event {
            ClientEvent::Authenticate { token } => {
                match state.verifier.verify(&token).await {
                    Ok(Some(user)) => {
                        info!(user = user.id, name = %user.name, "client authenticated");
                        session.user = Some(user.clone());
                        send_event(
                            ws_tx,
                            &ServerEvent::Authenticated {
                                success: true,
                                user: Some(user),
                            },
                        )
                        .await;
                        return true;
                    }
                    Ok(None) => {
                        warn!("rejected invalid or expired token");
                        send_event(
                            ws_tx,
                            &ServerEvent::Authenticated {
                                success: false,
                                user: None,
                            },
                        )
                        .await;
                        return false;
                    }
                    Err(e) => {
                        warn!("token verification failed: {}", e);
                        send_event(ws_tx, &ServerEvent::error("authentication unavailable")).await;
                        return false;
                    }
                }
            }
            ClientEvent::Ping => {
                send_event(ws_tx, &ServerEvent::Pong).await;
            }
            _ => {
                // Vault messages before authentication drop the connection.
                send_event(ws_tx, &ServerEvent::error("authenticate first")).await;
                return false;
            }
        }
    }
    false
}

async fn handle_client_event(session: &mut ClientSession, state: &WsState, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("malformed client event: {}", e);
            session.send(ServerEvent::error("malformed event"));
            return;
        }
    };

    match event {
        ClientEvent::Authenticate { .. } => {
            session.send(ServerEvent::error("already authenticated"));
        }
        ClientEvent::JoinVault { vault_id } => {
            state.engine.join(session, &vault_id).await;
        }
        ClientEvent::LeaveVault { vault_id } => {
            match &session.joined {
                Some((joined, _)) if *joined == vault_id => {
                    state.engine.leave(session).await;
                }
                _ => session.send(ServerEvent::error("not joined to that vault")),
            }
        }
        ClientEvent::SyncMessage { payload } => {
            state.engine.handle_frame(session, &payload).await;
        }
        ClientEvent::Ping => session.send(ServerEvent::Pong),
    }
}
