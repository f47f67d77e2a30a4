use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio_util::sync::CancellationToken;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
};

use crate::{
    error::{Error, SignalingErrorKind},
    permissions::Permissions,
    signaling::{
        message::{Envelope, RtcType, SdpPayload},
        writer::Outbound,
    },
    transport::PeerTransport,
};

/// A user connected to a room: its transport, its outbound queue and the mute state other
/// tasks read while forwarding.
#[derive(Debug)]
pub struct Peer {
    pub user_id: String,
    /// Distinguishes two sessions of the same user.
    pub session_id: String,
    pub transport: Arc<PeerTransport>,
    outbound: Outbound,
    permissions: Permissions,
    self_muted: Arc<AtomicBool>,
    muted_remotes: parking_lot::Mutex<HashSet<String>>,
    initial_offer_sent: AtomicBool,
    pending_negotiation: AtomicBool,
    negotiation_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        user_id: String,
        transport: Arc<PeerTransport>,
        outbound: Outbound,
        permissions: Permissions,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            transport,
            outbound,
            permissions,
            self_muted: Arc::new(AtomicBool::new(false)),
            muted_remotes: parking_lot::Mutex::new(HashSet::new()),
            initial_offer_sent: AtomicBool::new(false),
            pending_negotiation: AtomicBool::new(false),
            negotiation_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        tracing::debug!(
            "Peer user={} session={} is created",
            peer.user_id,
            peer.session_id
        );
        peer
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn set_self_muted(&self, muted: bool) {
        self.self_muted.store(muted, Ordering::Release);
    }

    pub fn is_self_muted(&self) -> bool {
        self.self_muted.load(Ordering::Acquire)
    }

    /// The flag publications of this peer check before every packet.
    pub(crate) fn self_muted_flag(&self) -> Arc<AtomicBool> {
        self.self_muted.clone()
    }

    /// Returns `true` when the preference actually changed.
    pub fn set_user_muted(&self, user_id: &str, muted: bool) -> bool {
        let mut muted_remotes = self.muted_remotes.lock();
        if muted {
            muted_remotes.insert(user_id.to_string())
        } else {
            muted_remotes.remove(user_id)
        }
    }

    pub fn is_user_muted(&self, user_id: &str) -> bool {
        self.muted_remotes.lock().contains(user_id)
    }

    pub fn needs_initial_offer(&self) -> bool {
        !self.initial_offer_sent.load(Ordering::Acquire)
    }

    /// Returns `true` for the caller that flipped the flag.
    pub fn mark_initial_offer_sent(&self) -> bool {
        !self.initial_offer_sent.swap(true, Ordering::AcqRel)
    }

    pub async fn send(&self, envelope: Envelope) -> bool {
        self.outbound.send(envelope).await
    }

    pub fn send_nowait(&self, envelope: Envelope) {
        self.outbound.send_nowait(envelope)
    }

    /// Sends the one unsolicited offer a peer gets after joining. Later calls do nothing.
    pub async fn send_initial_offer(&self) -> Result<(), Error> {
        let _guard = self.negotiation_lock.lock().await;
        if !self.mark_initial_offer_sent() {
            return Ok(());
        }
        // The first offer already carries every track attached so far.
        self.pending_negotiation.store(false, Ordering::Release);
        self.offer().await
    }

    /// Asks for a new server offer. It goes out as soon as signaling is stable.
    pub fn request_negotiation(self: &Arc<Self>) {
        self.pending_negotiation.store(true, Ordering::Release);
        let peer = self.clone();
        tokio::spawn(async move {
            peer.resume_pending_negotiation().await;
        });
    }

    pub fn has_pending_negotiation(&self) -> bool {
        self.pending_negotiation.load(Ordering::Acquire)
    }

    /// Sends the pending offer if there is one and the transport can take it. Called after
    /// every request and every time signaling returns to `stable`.
    pub async fn resume_pending_negotiation(&self) {
        let _guard = self.negotiation_lock.lock().await;
        if self.is_closed() || self.needs_initial_offer() {
            return;
        }
        if self.transport.signaling_state() != RTCSignalingState::Stable {
            return;
        }
        if !self.pending_negotiation.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Peer user={} renegotiates", self.user_id);
        if let Err(err) = self.offer().await {
            tracing::error!(
                "Peer user={} failed to create offer: {}",
                self.user_id,
                err
            );
            self.close_session();
        }
    }

    // Callers hold the negotiation lock.
    async fn offer(&self) -> Result<(), Error> {
        let offer = self.transport.create_offer().await?;
        let payload = SdpPayload { sdp: offer.sdp };
        if !self.send(Envelope::rtc(RtcType::Offer, &payload)).await {
            return Err(Error::new_signaling(
                format!("outbound queue of {} is closed", self.user_id),
                SignalingErrorKind::SocketClosed,
            ));
        }
        // Candidates are only gathered from here on, so they always follow the offer.
        self.transport.set_local_description(offer.local).await
    }

    /// Applies a client offer and answers it. Returns `false` when the offer collided with an
    /// outstanding server offer: ours stands and the client is expected to roll back and
    /// answer it, then offer again.
    pub async fn handle_remote_offer(&self, sdp: String) -> Result<bool, Error> {
        let _guard = self.negotiation_lock.lock().await;
        if self.transport.signaling_state() == RTCSignalingState::HaveLocalOffer {
            tracing::info!(
                "Peer user={} offer collides with the server offer, ignored",
                self.user_id
            );
            return Ok(false);
        }
        let offer = RTCSessionDescription::offer(sdp)?;
        self.transport.apply_remote_offer(offer).await?;
        let answer = self.transport.create_answer().await?;
        let payload = SdpPayload {
            sdp: answer.sdp.clone(),
        };
        if !self.send(Envelope::rtc(RtcType::Answer, &payload)).await {
            return Err(Error::new_signaling(
                format!("outbound queue of {} is closed", self.user_id),
                SignalingErrorKind::SocketClosed,
            ));
        }
        self.transport.set_local_description(answer).await?;
        Ok(true)
    }

    pub async fn handle_answer(&self, sdp: String) -> Result<(), Error> {
        let _guard = self.negotiation_lock.lock().await;
        let answer = RTCSessionDescription::answer(sdp)?;
        self.transport.apply_answer(answer).await
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.transport.add_ice_candidate(candidate).await
    }

    /// Ends the signaling session that owns this peer.
    pub fn close_session(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        tracing::debug!(
            "Peer user={} session={} is dropped",
            self.user_id,
            self.session_id
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::WebRTCTransportConfig,
        signaling::{message::MessageKind, writer::Outgoing},
    };
    use tokio::sync::mpsc;
    use webrtc::{
        api::{media_engine::MediaEngine, APIBuilder},
        peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
        rtp_transceiver::rtp_codec::RTPCodecType,
    };

    pub(crate) async fn test_peer(
        user_id: &str,
        permissions: Permissions,
    ) -> (Arc<Peer>, mpsc::Receiver<Outgoing>) {
        let transport = PeerTransport::new(&WebRTCTransportConfig::default(), 64_000)
            .await
            .unwrap();
        let (outbound, receiver) = Outbound::channel(64);
        let peer = Peer::new(user_id.to_string(), transport, outbound, permissions);
        (peer, receiver)
    }

    fn voice() -> Permissions {
        Permissions::CONNECT | Permissions::SPEAK | Permissions::STREAM
    }

    #[tokio::test]
    async fn test_mute_flags() {
        let (peer, _rx) = test_peer("1", voice()).await;
        assert!(!peer.is_self_muted());
        peer.set_self_muted(true);
        assert!(peer.is_self_muted());
        assert!(peer.self_muted_flag().load(Ordering::Acquire));

        assert!(peer.set_user_muted("2", true));
        assert!(!peer.set_user_muted("2", true));
        assert!(peer.is_user_muted("2"));
        assert!(!peer.is_user_muted("3"));
        assert!(peer.set_user_muted("2", false));
        assert!(!peer.is_user_muted("2"));
        peer.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_offer_is_sent_once() {
        let (peer, mut rx) = test_peer("1", voice()).await;
        assert!(peer.needs_initial_offer());
        peer.send_initial_offer().await.unwrap();
        peer.send_initial_offer().await.unwrap();
        assert!(!peer.needs_initial_offer());

        match rx.recv().await {
            Some(Outgoing::Message(envelope)) => {
                assert_eq!(envelope.kind(), MessageKind::Rtc(RtcType::Offer));
                let offer: SdpPayload = envelope.payload().unwrap();
                assert!(offer.sdp.contains("maxaveragebitrate=64000"));
            }
            other => panic!("unexpected outgoing {:?}", other),
        }
        assert_eq!(
            peer.transport.signaling_state(),
            RTCSignalingState::HaveLocalOffer
        );
        while let Ok(outgoing) = rx.try_recv() {
            if let Outgoing::Message(envelope) = outgoing {
                assert_ne!(envelope.kind(), MessageKind::Rtc(RtcType::Offer));
            }
        }
        peer.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiation_waits_for_initial_offer() {
        let (peer, mut rx) = test_peer("1", voice()).await;
        peer.request_negotiation();
        peer.resume_pending_negotiation().await;
        assert!(peer.has_pending_negotiation());
        assert!(rx.try_recv().is_err());
        peer.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiation_is_deferred_until_stable() {
        let (peer, mut rx) = test_peer("1", voice()).await;
        peer.send_initial_offer().await.unwrap();
        let _ = rx.recv().await;

        // The initial offer is still unanswered.
        peer.request_negotiation();
        peer.resume_pending_negotiation().await;
        assert!(peer.has_pending_negotiation());
        peer.transport.close().await.unwrap();
    }

    async fn client_connection() -> RTCPeerConnection {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap()
    }

    async fn next_sdp(rx: &mut mpsc::Receiver<Outgoing>, t: RtcType) -> String {
        loop {
            match rx.recv().await {
                Some(Outgoing::Message(envelope)) if envelope.kind() == MessageKind::Rtc(t) => {
                    let payload: SdpPayload = envelope.payload().unwrap();
                    return payload.sdp;
                }
                Some(_) => continue,
                None => panic!("outbound closed before {}", t),
            }
        }
    }

    #[tokio::test]
    async fn test_colliding_client_offer_keeps_server_offer() {
        let (peer, mut rx) = test_peer("1", voice()).await;
        let client = client_connection().await;
        client
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();

        peer.send_initial_offer().await.unwrap();
        let server_offer = next_sdp(&mut rx, RtcType::Offer).await;

        // Both sides offered at once. The server keeps its offer and does not answer.
        let colliding = client.create_offer(None).await.unwrap();
        assert!(!peer.handle_remote_offer(colliding.sdp).await.unwrap());
        assert_eq!(
            peer.transport.signaling_state(),
            RTCSignalingState::HaveLocalOffer
        );
        assert!(!peer.is_closed());
        assert!(rx.try_recv().is_err());

        // The client gives way: it answers the server offer, then offers again.
        client
            .set_remote_description(RTCSessionDescription::offer(server_offer).unwrap())
            .await
            .unwrap();
        let answer = client.create_answer(None).await.unwrap();
        client.set_local_description(answer.clone()).await.unwrap();
        peer.handle_answer(answer.sdp).await.unwrap();
        assert_eq!(peer.transport.signaling_state(), RTCSignalingState::Stable);

        let offer = client.create_offer(None).await.unwrap();
        client.set_local_description(offer.clone()).await.unwrap();
        assert!(peer.handle_remote_offer(offer.sdp).await.unwrap());
        let server_answer = next_sdp(&mut rx, RtcType::Answer).await;
        client
            .set_remote_description(RTCSessionDescription::answer(server_answer).unwrap())
            .await
            .unwrap();
        assert_eq!(peer.transport.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(client.signaling_state(), RTCSignalingState::Stable);

        client.close().await.unwrap();
        peer.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_session() {
        let (peer, _rx) = test_peer("1", voice()).await;
        assert!(!peer.is_closed());
        peer.close_session();
        peer.closed().await;
        assert!(peer.is_closed());
        peer.transport.close().await.unwrap();
    }
}
