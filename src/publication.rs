use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use derivative::Derivative;
use uuid::Uuid;
use webrtc::{
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_sender::RTCRtpSender,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::{
    error::Error,
    transport::{PeerTransport, RtcpSender},
};

/// Anything RTP can be read from. [`TrackRemote`] in production.
pub trait RtpSource: Send + Sync + 'static {
    fn read_rtp(&self) -> impl Future<Output = Result<rtp::packet::Packet, webrtc::Error>> + Send;
}

impl RtpSource for Arc<TrackRemote> {
    async fn read_rtp(&self) -> Result<rtp::packet::Packet, webrtc::Error> {
        let (packet, _attributes) = TrackRemote::read_rtp(self).await?;
        Ok(packet)
    }
}

/// One forwarded track: RTP read from the publisher is written to `local_track`, which is
/// added to every subscribing peer's transport.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Publication {
    pub id: String,
    /// Publishing user.
    pub from: String,
    pub kind: RTPCodecType,
    pub ssrc: u32,
    pub local_track: Arc<TrackLocalStaticRTP>,
    #[derivative(Debug = "ignore")]
    sends: parking_lot::Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    publisher_muted: Arc<AtomicBool>,
    server_muted: AtomicBool,
    /// `false` when the publisher lacks the capability for this kind. Such tracks are drained.
    pub forwardable: bool,
    publisher_rtcp: Arc<RtcpSender>,
    received_packets: AtomicU64,
    forwarded_packets: AtomicU64,
}

impl Publication {
    pub fn new(
        from: String,
        kind: RTPCodecType,
        capability: RTCRtpCodecCapability,
        ssrc: u32,
        publisher_rtcp: Arc<RtcpSender>,
        publisher_muted: Arc<AtomicBool>,
        forwardable: bool,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        // Stream id is the publisher so clients can tell whose track they receive.
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.clone(),
            from.clone(),
        ));

        tracing::debug!(
            "Publication id={} from={} kind={} ssrc={} is created",
            id,
            from,
            kind,
            ssrc
        );

        Arc::new(Self {
            id,
            from,
            kind,
            ssrc,
            local_track,
            sends: parking_lot::Mutex::new(HashMap::new()),
            publisher_muted,
            server_muted: AtomicBool::new(false),
            forwardable,
            publisher_rtcp,
            received_packets: AtomicU64::new(0),
            forwarded_packets: AtomicU64::new(0),
        })
    }

    pub fn set_server_muted(&self, muted: bool) {
        self.server_muted.store(muted, Ordering::Release);
    }

    pub fn is_server_muted(&self) -> bool {
        self.server_muted.load(Ordering::Acquire)
    }

    fn should_forward(&self) -> bool {
        self.forwardable
            && !self.publisher_muted.load(Ordering::Acquire)
            && !self.is_server_muted()
    }

    pub fn is_attached(&self, subscriber: &str) -> bool {
        self.sends.lock().contains_key(subscriber)
    }

    pub fn subscribers(&self) -> Vec<String> {
        self.sends.lock().keys().cloned().collect()
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    pub fn forwarded_packets(&self) -> u64 {
        self.forwarded_packets.load(Ordering::Relaxed)
    }

    /// Adds the local track to `transport`. Returns `false` if `subscriber` already receives it
    /// or is the publisher itself.
    pub async fn attach(&self, subscriber: &str, transport: &PeerTransport) -> Result<bool, Error> {
        if subscriber == self.from || self.is_attached(subscriber) {
            return Ok(false);
        }
        let sender = transport.add_track(self.local_track.clone()).await?;
        self.sends
            .lock()
            .insert(subscriber.to_string(), sender.clone());
        self.rtcp_relay_loop(subscriber.to_string(), sender);
        tracing::debug!("Publication id={} attached to {}", self.id, subscriber);
        Ok(true)
    }

    /// Forgets the send handle of `subscriber` and hands it back for removal from its transport.
    pub fn detach(&self, subscriber: &str) -> Option<Arc<RTCRtpSender>> {
        let sender = self.sends.lock().remove(subscriber);
        if sender.is_some() {
            tracing::debug!("Publication id={} detached from {}", self.id, subscriber);
        }
        sender
    }

    pub fn detach_all(&self) -> Vec<(String, Arc<RTCRtpSender>)> {
        self.sends.lock().drain().collect()
    }

    /// Asks the publisher for a keyframe. Audio has none.
    pub fn request_keyframe(&self) {
        if self.kind != RTPCodecType::Video || !self.forwardable {
            return;
        }
        if let Err(err) = self.publisher_rtcp.send(Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        })) {
            tracing::debug!("Publication id={} failed to send pli: {}", self.id, err);
        }
    }

    // Reading RTCP also drives the sender's interceptors. PLIs are passed to the publisher.
    fn rtcp_relay_loop(&self, subscriber: String, sender: Arc<RTCRtpSender>) {
        let publisher_rtcp = self.publisher_rtcp.clone();
        let media_ssrc = self.ssrc;
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Ok((packets, _attributes)) = sender.read_rtcp().await {
                for packet in packets {
                    if packet
                        .as_any()
                        .downcast_ref::<PictureLossIndication>()
                        .is_some()
                    {
                        match publisher_rtcp.send(Box::new(PictureLossIndication {
                            sender_ssrc: 0,
                            media_ssrc,
                        })) {
                            Ok(_) => tracing::trace!("send rtcp: pli"),
                            Err(err) => {
                                tracing::error!(
                                    "Publication id={} failed to send rtcp pli: {}",
                                    id,
                                    err
                                );
                                return;
                            }
                        }
                    }
                }
            }
            tracing::debug!(
                "Publication id={} RTCP loop for {} has finished",
                id,
                subscriber
            );
        });
    }

    /// Copies RTP from `source` into the local track until the source fails.
    pub async fn forward<S: RtpSource>(self: Arc<Self>, source: S) {
        tracing::debug!(
            "Publication id={} from={} RTP forward loop has started",
            self.id,
            self.from
        );

        loop {
            let packet = match source.read_rtp().await {
                Ok(packet) => packet,
                Err(err) => {
                    if is_closed_error(&err) {
                        tracing::debug!("Publication id={} source closed: {}", self.id, err);
                    } else {
                        tracing::error!(
                            "Publication id={} failed to read rtp: {:#?}",
                            self.id,
                            err
                        );
                    }
                    break;
                }
            };
            self.received_packets.fetch_add(1, Ordering::Relaxed);

            if !self.should_forward() {
                continue;
            }

            tracing::trace!(
                "Publication id={} forwarding seq={} timestamp={}",
                self.id,
                packet.header.sequence_number,
                packet.header.timestamp
            );
            match self.local_track.write_rtp(&packet).await {
                Ok(_) => {
                    self.forwarded_packets.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::debug!("Publication id={} failed to write rtp: {}", self.id, err);
                }
            }
        }

        tracing::debug!(
            "Publication id={} RTP forward loop has finished",
            self.id
        );
    }
}

fn is_closed_error(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrClosedPipe
            | webrtc::Error::ErrDataChannelNotOpen
            | webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed)
            ))
    )
}

impl Drop for Publication {
    fn drop(&mut self) {
        tracing::debug!("Publication id={} is dropped", self.id);
    }
}
