use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};
use webrtc::{rtp_transceiver::rtp_codec::RTPCodecType, track::track_remote::TrackRemote};

use crate::{
    error::{Error, RoomErrorKind},
    peer::Peer,
    permissions::Permissions,
    publication::{Publication, RtpSource},
    room_manager::RoomManager,
};

#[derive(Debug, Default)]
struct RoomState {
    peers: HashMap<String, Arc<Peer>>,
    publications: Vec<Arc<Publication>>,
    server_muted: HashSet<String>,
    server_deafened: HashSet<String>,
    blocked: HashSet<String>,
}

/// Room is one voice channel: the connected peers, what they publish, and the moderation state
/// that outlives a single connection. Every mutation happens under the room lock.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    state: Mutex<RoomState>,
    closed: AtomicBool,
    cleanup_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(id: String) -> Arc<Self> {
        tracing::debug!("Room {} is created", id);
        Arc::new(Self {
            id,
            state: Mutex::new(RoomState::default()),
            closed: AtomicBool::new(false),
            cleanup_timer: parking_lot::Mutex::new(None),
        })
    }

    /// A closed room has been dropped by its cleanup timer and takes no more peers.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers `peer` and cancels a pending cleanup. A peer of the same user that was
    /// already present is replaced and returned.
    pub async fn add_peer(&self, peer: Arc<Peer>) -> Result<Option<Arc<Peer>>, Error> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(Error::new_room(
                format!("Room {} is closed", self.id),
                RoomErrorKind::Closed,
            ));
        }
        if let Some(timer) = self.cleanup_timer.lock().take() {
            timer.abort();
            tracing::debug!("Room {} cleanup is cancelled", self.id);
        }

        let previous = state.peers.insert(peer.user_id.clone(), peer.clone());
        if previous.is_some() {
            tracing::info!("Peer {} in room {} is replaced", peer.user_id, self.id);
            self.strip_peer(&mut state, &peer.user_id).await;
        }
        tracing::info!(
            "Peer {} joined room {} ({} peers)",
            peer.user_id,
            self.id,
            state.peers.len()
        );
        Ok(previous)
    }

    pub async fn remove_peer(&self, user_id: &str) -> Option<Arc<Peer>> {
        let mut state = self.state.lock().await;
        let removed = state.peers.remove(user_id)?;
        self.strip_peer(&mut state, user_id).await;
        tracing::info!("Peer {} left room {}", user_id, self.id);
        Some(removed)
    }

    /// Like [`Room::remove_peer`] but only when `peer` is still the registered one, so a
    /// replaced session cannot remove its successor.
    pub async fn remove_peer_if(&self, peer: &Arc<Peer>) -> bool {
        let mut state = self.state.lock().await;
        match state.peers.get(&peer.user_id) {
            Some(current) if Arc::ptr_eq(current, peer) => {}
            _ => return false,
        }
        state.peers.remove(&peer.user_id);
        self.strip_peer(&mut state, &peer.user_id).await;
        tracing::info!("Peer {} left room {}", peer.user_id, self.id);
        true
    }

    // Drops every trace of a departing connection of `user_id`. Deafen is per connection;
    // mute and block stay with the room.
    async fn strip_peer(&self, state: &mut RoomState, user_id: &str) {
        for publication in state.publications.iter() {
            // Its transport is closed with it.
            publication.detach(user_id);
        }

        let (withdrawn, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.publications)
            .into_iter()
            .partition(|publication| publication.from == user_id);
        state.publications = kept;
        for publication in withdrawn {
            tracing::debug!(
                "Publication {} is withdrawn from room {}",
                publication.id,
                self.id
            );
            Self::detach_everywhere(state, &publication).await;
        }

        state.server_deafened.remove(user_id);
    }

    async fn detach_everywhere(state: &RoomState, publication: &Publication) {
        for (subscriber, sender) in publication.detach_all() {
            if let Some(peer) = state.peers.get(&subscriber) {
                if let Err(err) = peer.transport.remove_track(&sender).await {
                    tracing::warn!(
                        "failed to remove publication {} from {}: {}",
                        publication.id,
                        subscriber,
                        err
                    );
                }
                peer.request_negotiation();
            }
        }
    }

    pub async fn peer(&self, user_id: &str) -> Option<Arc<Peer>> {
        self.state.lock().await.peers.get(user_id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.lock().await.peers.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn publications(&self) -> Vec<Arc<Publication>> {
        self.state.lock().await.publications.clone()
    }

    /// `(peers, publications)`
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.peers.len(), state.publications.len())
    }

    /// Schedules removal from `manager` after `delay` if the room is empty. The timer checks
    /// again when it fires, and [`Room::add_peer`] cancels it.
    pub async fn maybe_cleanup(self: &Arc<Self>, manager: &RoomManager, delay: Duration) {
        let state = self.state.lock().await;
        if !state.peers.is_empty() || self.is_closed() {
            return;
        }
        let mut timer = self.cleanup_timer.lock();
        if timer.is_some() {
            return;
        }

        tracing::debug!("Room {} is empty, cleanup in {:?}", self.id, delay);
        let room = self.clone();
        let manager = manager.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let state = room.state.lock().await;
                room.cleanup_timer.lock().take();
                if !state.peers.is_empty() || !state.publications.is_empty() {
                    return;
                }
                room.closed.store(true, Ordering::Release);
            }
            manager.remove_if_same(&room).await;
        }));
    }

    /// Starts forwarding a track the peer sends us.
    pub async fn publish_track(self: &Arc<Self>, publisher: &Arc<Peer>, track: Arc<TrackRemote>) {
        let kind = track.kind();
        let forwardable = can_publish(publisher.permissions(), kind);
        if !forwardable {
            tracing::warn!(
                "Peer {} may not publish {} in room {}, track is dropped",
                publisher.user_id,
                kind,
                self.id
            );
        }
        let publication = Publication::new(
            publisher.user_id.clone(),
            kind,
            track.codec().capability,
            track.ssrc(),
            publisher.transport.rtcp_sender(),
            publisher.self_muted_flag(),
            forwardable,
        );
        self.start_publication(publisher, publication, track).await;
    }

    pub(crate) async fn start_publication<S: RtpSource>(
        self: &Arc<Self>,
        publisher: &Arc<Peer>,
        publication: Arc<Publication>,
        source: S,
    ) {
        if publication.forwardable {
            self.add_publication(publisher, publication.clone()).await;
        }
        let room = Arc::downgrade(self);
        tokio::spawn(async move {
            publication.clone().forward(source).await;
            if let Some(room) = room.upgrade() {
                room.unpublish(&publication.id).await;
            }
        });
    }

    async fn add_publication(&self, publisher: &Arc<Peer>, publication: Arc<Publication>) -> bool {
        let mut state = self.state.lock().await;
        match state.peers.get(&publication.from) {
            Some(current) if Arc::ptr_eq(current, publisher) => {}
            _ => {
                tracing::debug!(
                    "Publisher {} is gone, publication {} is not added",
                    publication.from,
                    publication.id
                );
                return false;
            }
        }
        publication.set_server_muted(state.server_muted.contains(&publication.from));
        state.publications.push(publication.clone());

        let peers: Vec<Arc<Peer>> = state.peers.values().cloned().collect();
        for peer in peers {
            self.attach_locked(&state, &publication, &peer, true).await;
        }
        tracing::info!(
            "Publication {} ({}) from {} is added to room {}",
            publication.id,
            publication.kind,
            publication.from,
            self.id
        );
        true
    }

    /// Withdraws a publication and detaches it from every subscriber.
    pub async fn unpublish(&self, publication_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .publications
            .iter()
            .position(|publication| publication.id == publication_id)
        else {
            return false;
        };
        let publication = state.publications.remove(index);
        Self::detach_everywhere(&state, &publication).await;
        tracing::info!(
            "Publication {} is removed from room {}",
            publication_id,
            self.id
        );
        true
    }

    fn eligible(state: &RoomState, publication: &Publication, peer: &Peer) -> bool {
        publication.from != peer.user_id
            && !state.server_deafened.contains(&peer.user_id)
            && !(publication.kind == RTPCodecType::Audio && peer.is_user_muted(&publication.from))
    }

    async fn attach_locked(
        &self,
        state: &RoomState,
        publication: &Publication,
        peer: &Arc<Peer>,
        negotiate: bool,
    ) -> bool {
        if !Self::eligible(state, publication, peer) {
            return false;
        }
        match publication.attach(&peer.user_id, &peer.transport).await {
            Ok(true) => {
                if negotiate {
                    peer.request_negotiation();
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(
                    "failed to attach publication {} to {}: {}",
                    publication.id,
                    peer.user_id,
                    err
                );
                false
            }
        }
    }

    async fn detach_locked(&self, publication: &Publication, peer: &Arc<Peer>, negotiate: bool) -> bool {
        let Some(sender) = publication.detach(&peer.user_id) else {
            return false;
        };
        if let Err(err) = peer.transport.remove_track(&sender).await {
            tracing::warn!(
                "failed to detach publication {} from {}: {}",
                publication.id,
                peer.user_id,
                err
            );
        }
        if negotiate {
            peer.request_negotiation();
        }
        true
    }

    /// Attaches one publication to one peer if the peer may receive it.
    pub async fn attach_publication_to_peer(
        &self,
        publication_id: &str,
        user_id: &str,
        negotiate: bool,
    ) -> bool {
        let state = self.state.lock().await;
        let (Some(publication), Some(peer)) = (
            state.publications.iter().find(|p| p.id == publication_id),
            state.peers.get(user_id),
        ) else {
            return false;
        };
        self.attach_locked(&state, publication, peer, negotiate).await
    }

    pub async fn detach_publication_from_peer(&self, publication_id: &str, user_id: &str) -> bool {
        let state = self.state.lock().await;
        let (Some(publication), Some(peer)) = (
            state.publications.iter().find(|p| p.id == publication_id),
            state.peers.get(user_id),
        ) else {
            return false;
        };
        self.detach_locked(publication, peer, true).await
    }

    /// Attaches what is already published to a peer that just joined, without renegotiating:
    /// its first offer carries these tracks.
    pub async fn attach_existing_publications(&self, peer: &Arc<Peer>) -> usize {
        let state = self.state.lock().await;
        let mut attached = 0;
        for publication in state.publications.iter() {
            if self.attach_locked(&state, publication, peer, false).await {
                attached += 1;
            }
        }
        attached
    }

    /// Re-evaluates every publication for `user_id` after its mute preferences changed.
    pub async fn resync_peer_subscriptions(&self, user_id: &str) {
        let state = self.state.lock().await;
        let Some(peer) = state.peers.get(user_id).cloned() else {
            return;
        };
        for publication in state.publications.iter() {
            if Self::eligible(&state, publication, &peer) {
                self.attach_locked(&state, publication, &peer, true).await;
            } else {
                self.detach_locked(publication, &peer, true).await;
            }
        }
    }

    /// Returns `true` when the state changed.
    pub async fn set_server_muted(&self, user_id: &str, muted: bool) -> bool {
        let mut state = self.state.lock().await;
        let changed = if muted {
            state.server_muted.insert(user_id.to_string())
        } else {
            state.server_muted.remove(user_id)
        };
        for publication in state.publications.iter().filter(|p| p.from == user_id) {
            publication.set_server_muted(muted);
        }
        if changed {
            tracing::info!("server mute of {} in room {} is {}", user_id, self.id, muted);
        }
        changed
    }

    /// Deafening detaches everything the peer receives. Undeafening attaches it all again.
    pub async fn set_server_deafened(&self, user_id: &str, deafened: bool) -> bool {
        let mut state = self.state.lock().await;
        let changed = if deafened {
            state.server_deafened.insert(user_id.to_string())
        } else {
            state.server_deafened.remove(user_id)
        };
        if !changed {
            return false;
        }
        tracing::info!("server deafen of {} in room {} is {}", user_id, self.id, deafened);

        let Some(peer) = state.peers.get(user_id).cloned() else {
            return true;
        };
        for publication in state.publications.iter() {
            if deafened {
                self.detach_locked(publication, &peer, true).await;
            } else {
                self.attach_locked(&state, publication, &peer, true).await;
            }
        }
        true
    }

    pub async fn set_blocked(&self, user_id: &str, blocked: bool) -> bool {
        let mut state = self.state.lock().await;
        let changed = if blocked {
            state.blocked.insert(user_id.to_string())
        } else {
            state.blocked.remove(user_id)
        };
        if changed {
            tracing::info!("block of {} in room {} is {}", user_id, self.id, blocked);
        }
        changed
    }

    pub async fn is_blocked(&self, user_id: &str) -> bool {
        self.state.lock().await.blocked.contains(user_id)
    }

    pub async fn is_server_muted(&self, user_id: &str) -> bool {
        self.state.lock().await.server_muted.contains(user_id)
    }

    pub async fn is_server_deafened(&self, user_id: &str) -> bool {
        self.state.lock().await.server_deafened.contains(user_id)
    }

    pub async fn request_keyframes(&self) {
        let state = self.state.lock().await;
        for publication in state.publications.iter() {
            publication.request_keyframe();
        }
    }
}

fn can_publish(permissions: Permissions, kind: RTPCodecType) -> bool {
    match kind {
        RTPCodecType::Audio => permissions.allows(Permissions::SPEAK),
        RTPCodecType::Video => permissions.allows(Permissions::STREAM),
        _ => false,
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        tracing::debug!("Room {} is dropped", self.id);
    }
}
