//! Process-wide room-id → `RoomRouter` map. Rooms are created lazily on
//! first join and torn down once their last member leaves.
//!
//! Grounded on the teacher's `room_manager.rs` (`DashMap` registry pattern)
//! and `original_source/pkg/ws/rooms.go` (lazy creation, delete-when-empty).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::id_types::RoomId;
use crate::metrics::SFU_ACTIVE_ROOMS;
use crate::room::RoomRouter;

pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<RoomRouter>>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(RoomRegistry {
            rooms: DashMap::new(),
        })
    }

    pub fn get_or_create(&self, room_id: &RoomId) -> Arc<RoomRouter> {
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room_id = %room_id, "room created");
                SFU_ACTIVE_ROOMS.inc();
                RoomRouter::new(room_id.clone())
            })
            .clone()
    }

    /// Drop the room from the registry if it has no members left. Safe to
    /// call unconditionally after every `RoomRouter::remove`.
    pub async fn remove_if_empty(&self, room_id: &RoomId) {
        let should_remove = match self.rooms.get(room_id) {
            Some(router) => router.member_count().await == 0,
            None => false,
        };
        if should_remove {
            self.rooms.remove(room_id);
            SFU_ACTIVE_ROOMS.dec();
            info!(room_id = %room_id, "room deleted (empty)");
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
