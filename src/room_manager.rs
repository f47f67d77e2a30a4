use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::room::Room;

/// Registry of the rooms hosted by this instance, keyed by voice channel id.
#[derive(Debug, Clone, Default)]
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the room for `channel_id`, creating it when there is none or when the existing
    /// one has already been closed by its cleanup timer.
    pub async fn get_or_create(&self, channel_id: &str) -> Arc<Room> {
        // Fast path: room exists
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel_id) {
                if !room.is_closed() {
                    return room.clone();
                }
            }
        }

        // Slow path: create room
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(channel_id) {
            if !room.is_closed() {
                return room.clone();
            }
        }

        let room = Room::new(channel_id.to_string());
        rooms.insert(channel_id.to_string(), room.clone());
        tracing::info!("Room {} is registered", channel_id);
        room
    }

    pub async fn get(&self, channel_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(channel_id).cloned()
    }

    pub async fn remove(&self, channel_id: &str) -> Option<Arc<Room>> {
        let removed = self.rooms.write().await.remove(channel_id);
        if removed.is_some() {
            tracing::info!("Room {} is unregistered", channel_id);
        }
        removed
    }

    /// Removes `room` only if it is still the registered instance for its channel.
    pub(crate) async fn remove_if_same(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(&room.id) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(&room.id);
                tracing::info!("Room {} is unregistered", room.id);
                true
            }
            _ => false,
        }
    }

    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Connected peers across every room. Reported as this instance's load.
    pub async fn peer_count(&self) -> usize {
        let mut count = 0;
        for room in self.rooms().await {
            count += room.peer_count().await;
        }
        count
    }

    /// Periodically asks every video publisher for a keyframe so late subscribers start fast.
    pub fn spawn_keyframe_loop(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for room in manager.rooms().await {
                            room.request_keyframes().await;
                        }
                    }
                }
            }
            tracing::debug!("keyframe loop has finished");
        })
    }
}
