//! Mesh rendezvous WebSocket endpoint
//!
//! JSON text frames. A connection joins one topic, is handed a participant id
//! and may then send signals to other members of that topic.

mod hub;

pub use hub::{MemberSender, RendezvousHub};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use plaza_core::models::ParticipantId;
use plaza_core::protocol::{ClientMessage, ServerMessage};

use crate::state::AppState;

/// `GET /ws/rendezvous`
pub async fn rendezvous_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.config.rendezvous.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.rendezvous.send_queue_size);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode rendezvous message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(error = %e, "Rendezvous socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut member: Option<ParticipantId> = None;
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Rendezvous socket read failed");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Join { topic }) => {
                if member.is_some() {
                    reply(&tx, "already joined a topic");
                } else {
                    member = Some(state.hub.join(&topic, tx.clone()));
                }
            }
            Ok(ClientMessage::Signal { to, signal }) => match &member {
                Some(from) => {
                    if !state.hub.relay_signal(from, &to, signal) {
                        reply(&tx, &format!("peer {to} is not in this topic"));
                    }
                }
                None => reply(&tx, "join a topic before signaling"),
            },
            Ok(ClientMessage::Leave) => break,
            Err(e) => reply(&tx, &format!("malformed message: {e}")),
        }
    }

    if let Some(id) = member {
        state.hub.leave(&id);
        info!(participant = %id, "Rendezvous connection closed");
    }
    drop(tx);
    let _ = writer.await;
}

fn reply(tx: &MemberSender, message: &str) {
    let _ = tx.try_send(ServerMessage::Error {
        message: message.to_string(),
    });
}
