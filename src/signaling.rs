//! The per-connection WebSocket signaling handler: reads framed envelopes,
//! dispatches by event type, and drains the participant's outbound queue
//! back onto the socket.
//!
//! Grounded on `original_source/pkg/ws/socket_handler.go` and
//! `pkg/ws/ws.go` — the teacher has no analog (its `signaling_handler.rs`
//! is a gRPC bidirectional stream, not a WebSocket).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use warp::ws::{Message, WebSocket};

use crate::codec::{ClientEvent, Envelope, ServerEvent};
use crate::id_types::{RoomId, UserId};
use crate::metrics::{SFU_WS_CONNECTIONS_TOTAL, SFU_WS_CONNECTION_FAILURES_TOTAL};
use crate::participant::ParticipantSession;
use crate::registry::RoomRegistry;

/// Drives one signaling connection end to end. Returns once the socket
/// closes, by any path (client hangUp, read error, or dropped connection).
pub async fn handle_connection(ws: WebSocket, room_id: RoomId, user_id: UserId, registry: Arc<RoomRegistry>) {
    SFU_WS_CONNECTIONS_TOTAL.inc();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (session, mut outbound_rx) = ParticipantSession::new(user_id.clone(), room_id.clone());
    let room_for_writer = room_id.clone();

    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let envelope = event.encode(room_for_writer.as_ref());
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound envelope"),
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut joined = false;
    let mut ended_in_error = false;

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "signaling read error");
                ended_in_error = true;
                break;
            }
        };
        if !msg.is_text() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(msg.to_str().unwrap_or("")) {
            Ok(env) => env,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to parse signaling envelope");
                continue;
            }
        };
        let event = match ClientEvent::decode(&envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to decode client event");
                continue;
            }
        };

        match event {
            ClientEvent::Ready { nickname } => {
                if let Err(e) = session.open_publish().await {
                    warn!(user_id = %user_id, error = %e, "failed to open publish session");
                    ended_in_error = true;
                    break;
                }
                let router = registry.get_or_create(&room_id);
                router.add(session.clone(), nickname).await;
                joined = true;
            }
            ClientEvent::Signal(signal) => {
                let router = registry.get_or_create(&room_id);
                if let Err(e) = router.process_signal(signal).await {
                    warn!(user_id = %user_id, error = %e, "failed to process signal");
                }
            }
            ClientEvent::HangUp { .. } => {
                break;
            }
            ClientEvent::Ping => {}
        }
    }

    writer_task.abort();
    session.close().await;
    if joined {
        let router = registry.get_or_create(&room_id);
        router.remove(&user_id).await;
        registry.remove_if_empty(&room_id).await;
    }
    if ended_in_error {
        SFU_WS_CONNECTION_FAILURES_TOTAL.inc();
    }
    info!(user_id = %user_id, room_id = %room_id, "signaling connection closed");
}

/// Builds the `/ws/{room_id}/{user_id}` upgrade route.
pub fn route(
    registry: Arc<RoomRegistry>,
) -> impl warp::Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    use warp::Filter;

    warp::path("ws")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::any().map(move || registry.clone()))
        .map(|room: String, user: String, ws: warp::ws::Ws, registry: Arc<RoomRegistry>| {
            ws.on_upgrade(move |socket| {
                handle_connection(socket, RoomId::from(room), UserId::from(user), registry)
            })
        })
}
