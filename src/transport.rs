use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_candidate_type::RTCIceCandidateType,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState, RTCPeerConnection,
    },
    rtcp,
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
        track_remote::TrackRemote,
    },
};
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use crate::{
    config::WebRTCTransportConfig,
    error::{Error, TransportErrorKind},
    sdp::limit_audio_bitrate_in_sdp,
};

pub type RtcpSender = mpsc::UnboundedSender<Box<dyn rtcp::packet::Packet + Send + Sync>>;
pub type RtcpReceiver = mpsc::UnboundedReceiver<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub type OnIceCandidateFn = Box<dyn Fn(RTCIceCandidateInit) + Send + Sync>;
pub type OnTrackFn = Box<dyn Fn(Arc<TrackRemote>) + Send + Sync>;
pub type OnSignalingStableFn = Box<dyn Fn() + Send + Sync>;
pub type OnConnectionFailedFn = Box<dyn Fn() + Send + Sync>;

/// A server offer in its two forms.
#[derive(Debug, Clone)]
pub struct ServerOffer {
    pub local: RTCSessionDescription,
    pub sdp: String,
}

/// One [`webrtc::peer_connection::RTCPeerConnection`] per connected peer. It receives the peer's
/// microphone/camera and carries every track the peer is subscribed to.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerTransport {
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    max_audio_bitrate: u64,
    // For RTCP writer
    rtcp_sender_channel: Arc<RtcpSender>,
    rtcp_writer_stop: CancellationToken,
    // For callback fn
    #[derivative(Debug = "ignore")]
    on_ice_candidate_fn: Arc<Mutex<OnIceCandidateFn>>,
    #[derivative(Debug = "ignore")]
    on_track_fn: Arc<Mutex<OnTrackFn>>,
    #[derivative(Debug = "ignore")]
    on_signaling_stable_fn: Arc<Mutex<OnSignalingStableFn>>,
    #[derivative(Debug = "ignore")]
    on_connection_failed_fn: Arc<Mutex<OnConnectionFailedFn>>,
    closed: AtomicBool,
}

impl PeerTransport {
    pub async fn new(
        transport_config: &WebRTCTransportConfig,
        max_audio_bitrate: u64,
    ) -> Result<Arc<Self>, Error> {
        let id = Uuid::new_v4().to_string();
        let (s, r) = mpsc::unbounded_channel();

        let peer_connection = Self::generate_peer_connection(transport_config).await?;

        // Receive-only slots for the peer's own microphone and camera.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }

        let transport = Arc::new(Self {
            id,
            peer_connection: Arc::new(peer_connection),
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            max_audio_bitrate,
            rtcp_sender_channel: Arc::new(s),
            rtcp_writer_stop: CancellationToken::new(),
            on_ice_candidate_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_track_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_signaling_stable_fn: Arc::new(Mutex::new(Box::new(|| {}))),
            on_connection_failed_fn: Arc::new(Mutex::new(Box::new(|| {}))),
            closed: AtomicBool::new(false),
        });

        transport.rtcp_writer_loop(r);
        transport.peer_connection_hooks();

        tracing::debug!("PeerTransport {} is created", transport.id);

        Ok(transport)
    }

    async fn generate_peer_connection(
        transport_config: &WebRTCTransportConfig,
    ) -> Result<RTCPeerConnection, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(range) = transport_config.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max)
                .map_err(|err| webrtc::Error::new(format!("invalid UDP port range: {}", err)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        if !transport_config.announced_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(
                transport_config
                    .announced_ips
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect(),
                RTCIceCandidateType::Host,
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let config = RTCConfiguration {
            ice_servers: transport_config.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(config).await?;
        Ok(peer_connection)
    }

    /// Creates an offer. `local` is what webrtc generated and must be set as the local
    /// description unchanged; `sdp` is the same offer with the audio bitrate cap applied, for
    /// the client.
    pub async fn create_offer(&self) -> Result<ServerOffer, Error> {
        self.ensure_open()?;
        let local = self.peer_connection.create_offer(None).await?;
        let sdp = limit_audio_bitrate_in_sdp(&local.sdp, self.max_audio_bitrate);
        Ok(ServerOffer { local, sdp })
    }

    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        self.peer_connection.set_local_description(desc).await?;
        Ok(())
    }

    /// Applies a client offer. Only valid in `stable`: webrtc cannot roll back a local offer, so
    /// a client offer that collides with ours is refused with `SignalingStateInvalid`.
    pub async fn apply_remote_offer(&self, offer: RTCSessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        if self.peer_connection.signaling_state() != RTCSignalingState::Stable {
            return Err(Error::new_transport(
                format!(
                    "Signaling state is {}",
                    self.peer_connection.signaling_state()
                ),
                TransportErrorKind::SignalingStateInvalid,
            ));
        }
        tracing::debug!("PeerTransport {} set remote offer", self.id);
        self.peer_connection.set_remote_description(offer).await?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        self.ensure_open()?;
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(answer)
    }

    /// Applies the client's answer to our offer.
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        if self.peer_connection.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Err(Error::new_transport(
                format!(
                    "Signaling state is {}",
                    self.peer_connection.signaling_state()
                ),
                TransportErrorKind::SignalingStateInvalid,
            ));
        }
        tracing::debug!("PeerTransport {} set remote answer", self.id);
        self.peer_connection.set_remote_description(answer).await?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if let Some(_rd) = self.peer_connection.remote_description().await {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let pendings: Vec<RTCIceCandidateInit> =
            self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pendings {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }

    /// Adds a subscription. The returned sender is needed to remove it again.
    pub async fn add_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<Arc<RTCRtpSender>, Error> {
        self.ensure_open()?;
        let sender = self
            .peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(sender)
    }

    pub async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        self.peer_connection.remove_track(sender).await?;
        Ok(())
    }

    /// Channel for RTCP packets (PLI) towards the peer, drained by the writer loop.
    pub fn rtcp_sender(&self) -> Arc<RtcpSender> {
        self.rtcp_sender_channel.clone()
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new_transport(
                format!("PeerTransport {} is closed", self.id),
                TransportErrorKind::Closed,
            ));
        }
        Ok(())
    }

    fn rtcp_writer_loop(&self, mut rtcp_receiver: RtcpReceiver) {
        let stop = self.rtcp_writer_stop.clone();
        let pc = self.peer_connection.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            tracing::debug!("PeerTransport {} RTCP writer loop", id);
            loop {
                tokio::select! {
                    data = rtcp_receiver.recv() => {
                        match data {
                            Some(data) => {
                                if let Err(err) = pc.write_rtcp(&[data]).await {
                                    tracing::error!("Error writing RTCP: {}", err);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = stop.cancelled() => break,
                };
            }
            tracing::debug!("PeerTransport {} RTCP writer loop stopped", id);
        });
    }

    fn peer_connection_hooks(&self) {
        let peer = self.peer_connection.clone();
        let id = self.id.clone();

        let on_ice_candidate = Arc::clone(&self.on_ice_candidate_fn);
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((on_ice_candidate) async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        tracing::debug!("on ice candidate: {}", candidate);
                        let locked = on_ice_candidate.lock().await;
                        (locked)(init);
                    }
                    Err(err) => tracing::error!("failed to serialize ice candidate: {}", err),
                }
            }))
        }));

        let on_track = Arc::clone(&self.on_track_fn);
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(enc!((on_track) async move {
                tracing::info!(
                    "Track received: track_id={}, ssrc={}, kind={}",
                    track.id(),
                    track.ssrc(),
                    track.kind()
                );
                let locked = on_track.lock().await;
                (locked)(track);
            }))
            },
        ));

        let on_signaling_stable = Arc::clone(&self.on_signaling_stable_fn);
        peer.on_signaling_state_change(Box::new(enc!((id) move |state: RTCSignalingState| {
            tracing::debug!("PeerTransport {} signaling state changed: {}", id, state);
            Box::pin(enc!((on_signaling_stable) async move {
                if state == RTCSignalingState::Stable {
                    let locked = on_signaling_stable.lock().await;
                    (locked)();
                }
            }))
        })));

        let on_connection_failed = Arc::clone(&self.on_connection_failed_fn);
        peer.on_peer_connection_state_change(Box::new(enc!((id) move |state: RTCPeerConnectionState| {
            tracing::debug!("PeerTransport {} connection state changed: {}", id, state);
            Box::pin(enc!((on_connection_failed) async move {
                if state == RTCPeerConnectionState::Failed {
                    let locked = on_connection_failed.lock().await;
                    (locked)();
                }
            }))
        })));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::trace!("ICE gathering state changed: {}", state);
            })
        }));
    }

    // Hooks
    /// Set callback function when the [`webrtc::peer_connection::RTCPeerConnection`] receives `on_ice_candidate` events.
    pub async fn on_ice_candidate(&self, f: OnIceCandidateFn) {
        let mut callback = self.on_ice_candidate_fn.lock().await;
        *callback = f;
    }

    /// Set callback function when the peer starts sending a track.
    pub async fn on_track(&self, f: OnTrackFn) {
        let mut callback = self.on_track_fn.lock().await;
        *callback = f;
    }

    /// Set callback function when the signaling state returns to `stable`.
    pub async fn on_signaling_stable(&self, f: OnSignalingStableFn) {
        let mut callback = self.on_signaling_stable_fn.lock().await;
        *callback = f;
    }

    pub async fn on_connection_failed(&self, f: OnConnectionFailedFn) {
        let mut callback = self.on_connection_failed_fn.lock().await;
        *callback = f;
    }

    /// Closes the peer connection. Only the first call does anything.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.rtcp_writer_stop.cancel();
        self.peer_connection.close().await?;
        tracing::debug!("PeerTransport {} is closed", self.id);
        Ok(())
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        tracing::debug!("PeerTransport {} is dropped", self.id);
    }
}
