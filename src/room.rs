//! `RoomRouter`: membership, fan-out of forwarded tracks between publish and
//! subscribe sessions, and data-channel broadcast, for one room.
//!
//! Grounded on `original_source/pkg/webrtc/room_controller.go` (fan-out on
//! join/leave) and the teacher's `room_manager.rs` (membership map shape),
//! generalized from a bare user-id list to full `ParticipantSession`
//! ownership.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::info;

use crate::broadcaster::ForwardedTrack;
use crate::codec::{ServerEvent, SignalEnvelope};
use crate::id_types::{RoomId, UserId};
use crate::metrics::SFU_ACTIVE_PEERS;
use crate::participant::{ParticipantSession, SessionError};

#[derive(Debug)]
pub enum RoomError {
    MembershipNotFound(UserId),
    Session(SessionError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::MembershipNotFound(id) => write!(f, "no member with clientId '{}' in this room", id),
            RoomError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RoomError {}

pub struct RoomRouter {
    pub room_id: RoomId,
    members: Mutex<HashMap<UserId, Arc<ParticipantSession>>>,
}

impl RoomRouter {
    pub fn new(room_id: RoomId) -> Arc<Self> {
        Arc::new(RoomRouter {
            room_id,
            members: Mutex::new(HashMap::new()),
        })
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Join a new participant: register it, hand it every existing
    /// publisher's current forwarded tracks, announce it to the whole room
    /// (itself included), and send it the roster.
    pub async fn add(self: &Arc<Self>, session: Arc<ParticipantSession>, metadata: String) {
        session.attach_router(Arc::downgrade(self)).await;
        *session.metadata.write().await = metadata.clone();

        let existing: Vec<Arc<ParticipantSession>> = {
            let mut members = self.members.lock().await;
            let existing = members.values().cloned().collect();
            members.insert(session.user_id.clone(), session.clone());
            existing
        };
        SFU_ACTIVE_PEERS.inc();

        for other in &existing {
            let tracks = other.forwarded_tracks().await;
            if !tracks.is_empty() {
                let _ = session
                    .add_subscriber_tracks(other.user_id.clone(), tracks)
                    .await;
            }
        }

        // Broadcast the join to the whole room, the new participant included
        // (mirrors `original_source`'s `Add`, which inserts the client before
        // broadcasting so the broadcast loop reaches it too).
        let join_event = ServerEvent::RoomJoin {
            client_id: session.user_id.clone(),
            metadata: metadata.clone(),
        };
        for member in existing.iter().chain(std::iter::once(&session)) {
            member.emit_for_room(join_event.clone()).await;
        }

        let mut roster: Vec<(UserId, String)> = Vec::with_capacity(existing.len());
        for other in &existing {
            roster.push((other.user_id.clone(), other.metadata.read().await.clone()));
        }
        session
            .emit_for_room(ServerEvent::Users { nicknames: roster })
            .await;

        info!(room_id = %self.room_id, user_id = %session.user_id, members = existing.len() + 1, "participant joined room");
    }

    /// Remove a participant, close its sessions, strip it from every other
    /// member's subscribe session, and announce the departure. Returns true
    /// if the room is now empty.
    pub async fn remove(&self, user_id: &UserId) -> bool {
        let removed = self.members.lock().await.remove(user_id);
        let Some(session) = removed else {
            return self.members.lock().await.is_empty();
        };
        SFU_ACTIVE_PEERS.dec();
        session.close().await;

        let remaining: Vec<Arc<ParticipantSession>> = self.members.lock().await.values().cloned().collect();
        for other in &remaining {
            other.remove_subscriber_tracks(user_id).await;
            other
                .emit_for_room(ServerEvent::HangUp {
                    user_id: user_id.clone(),
                })
                .await;
        }

        info!(room_id = %self.room_id, user_id = %user_id, remaining = remaining.len(), "participant left room");
        remaining.is_empty()
    }

    /// Resolve the target participant by `envelope.client_id` and dispatch
    /// the signal to it. Returns `MembershipNotFound` rather than mutating
    /// any state if no such member is currently in this room (spec.md §7's
    /// "signal targets a missing clientId").
    pub async fn process_signal(&self, envelope: SignalEnvelope) -> Result<(), RoomError> {
        let session = self
            .members
            .lock()
            .await
            .get(&envelope.client_id)
            .cloned()
            .ok_or_else(|| RoomError::MembershipNotFound(envelope.client_id.clone()))?;
        session.handle_signal(envelope).await.map_err(RoomError::Session)
    }

    /// Fan a freshly opened publisher track out to every other current
    /// member's subscribe session, one renegotiation each.
    pub async fn on_new_forwarded_track(&self, publisher: &UserId, track: Arc<ForwardedTrack>) {
        let subscribers: Vec<Arc<ParticipantSession>> = self
            .members
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id != publisher)
            .map(|(_, session)| session.clone())
            .collect();
        for subscriber in subscribers {
            let _ = subscriber
                .add_subscriber_tracks(publisher.clone(), vec![track.clone()])
                .await;
        }
    }

    /// Relay a data-channel message from `source` to every other member.
    pub async fn broadcast_data(&self, source: &UserId, data: Vec<u8>, is_binary: bool) {
        let targets: Vec<Arc<ParticipantSession>> = self
            .members
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id != source)
            .map(|(_, session)| session.clone())
            .collect();
        for target in targets {
            target.send_data(&data, is_binary).await;
        }
    }
}
