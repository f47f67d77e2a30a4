use std::{fmt::Display, sync::Arc, time::Duration};

use futures_util::{Sink, Stream, StreamExt};
use tokio::time::{Instant, Sleep};
use webrtc::track::track_remote::TrackRemote;

use crate::{
    config::{Config, MediaConfig, SessionConfig, WebRTCTransportConfig},
    error::{Error, ErrorKind, RoomErrorKind, SignalingErrorKind, TransportErrorKind},
    peer::Peer,
    permissions::Permissions,
    room::Room,
    room_manager::RoomManager,
    token::{JoinGrant, TokenValidator},
    transport::PeerTransport,
};

use super::{
    message::{
        BlockPayload, CandidatePayload, Envelope, HeartbeatPayload, JoinAck, JoinPayload,
        KickPayload, MessageKind, MovePayload, MovedPayload, MuteSelfPayload, MuteUserPayload,
        RtcType, SdpPayload, ServerDeafenPayload, ServerMutePayload,
    },
    writer::{spawn_writer, Outbound},
};

const ADD_PEER_ATTEMPTS: usize = 3;
/// How long the writer may take to flush once the session is over.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a session needs from the process.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub rooms: RoomManager,
    pub validator: Arc<TokenValidator>,
    pub session: SessionConfig,
    pub media: MediaConfig,
    pub transport: WebRTCTransportConfig,
}

impl SessionContext {
    pub fn new(config: &Config, rooms: RoomManager) -> Self {
        Self {
            rooms,
            validator: Arc::new(TokenValidator::new(&config.auth)),
            session: config.session.clone(),
            media: config.media.clone(),
            transport: config.transport.clone(),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// One signaling connection after a successful join.
#[derive(Debug)]
pub struct Session {
    room: Arc<Room>,
    peer: Arc<Peer>,
}

impl Session {
    /// Runs a connection to completion: join, message loop, teardown. `incoming` yields text
    /// frames; `outgoing` is written only by the session's writer task.
    pub async fn run<R, W>(ctx: SessionContext, mut incoming: R, outgoing: W)
    where
        R: Stream<Item = String> + Unpin + Send,
        W: Sink<String> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let (outbound, receiver) = Outbound::channel(ctx.session.outbound_queue);
        let mut writer = spawn_writer(receiver, outgoing);

        match Self::join(&ctx, &mut incoming, &outbound).await {
            Ok(session) => {
                session.message_loop(&ctx, &mut incoming).await;
                session.teardown(&ctx).await;
            }
            Err(err) => {
                tracing::info!("join is rejected: {}", err);
                outbound.send_nowait(Envelope::error(err.client_message()));
            }
        }

        // A stalled socket must not keep the session task alive.
        let drained = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, async {
            outbound.close().await;
            (&mut writer).await
        })
        .await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("writer task failed: {}", err),
            Err(_) => {
                tracing::warn!("socket did not drain within {:?}", WRITER_DRAIN_TIMEOUT);
                writer.abort();
            }
        }
    }

    async fn join<R>(ctx: &SessionContext, incoming: &mut R, outbound: &Outbound) -> Result<Self, Error>
    where
        R: Stream<Item = String> + Unpin + Send,
    {
        let first = match tokio::time::timeout(ctx.session.join_timeout, incoming.next()).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                return Err(Error::new_signaling(
                    "socket closed before join".to_string(),
                    SignalingErrorKind::SocketClosed,
                ))
            }
            Err(_) => {
                return Err(Error::new_signaling(
                    format!("no join within {:?}", ctx.session.join_timeout),
                    SignalingErrorKind::JoinTimeout,
                ))
            }
        };

        let envelope = Envelope::parse(&first)?;
        if envelope.kind() != MessageKind::Rtc(RtcType::Join) {
            return Err(Error::new_signaling(
                format!("first message is {:?}", envelope.kind()),
                SignalingErrorKind::UnexpectedMessage,
            ));
        }
        let join: JoinPayload = envelope.payload()?;
        let grant = ctx.validator.validate(&join.token)?;
        if let Some(channel) = &grant.channel_id {
            if *channel != join.channel {
                return Err(Error::new_signaling(
                    format!("token is for channel {}, join is for {}", channel, join.channel),
                    SignalingErrorKind::ChannelMismatch,
                ));
            }
        }

        let mut room = Self::admit(ctx, &join.channel, &grant).await?;

        let transport = match PeerTransport::new(&ctx.transport, ctx.media.max_audio_bitrate).await {
            Ok(transport) => transport,
            Err(err) => {
                room.maybe_cleanup(&ctx.rooms, ctx.media.room_grace_period)
                    .await;
                return Err(err);
            }
        };
        let peer = Peer::new(
            grant.user_id.clone(),
            transport.clone(),
            outbound.clone(),
            grant.permissions,
        );

        let mut attempt = 0;
        let added = loop {
            attempt += 1;
            match room.add_peer(peer.clone()).await {
                Err(err)
                    if attempt < ADD_PEER_ATTEMPTS
                        && matches!(err.kind, ErrorKind::RoomError(RoomErrorKind::Closed)) =>
                {
                    // Lost against the cleanup timer, the registry hands out a fresh room.
                    match Self::admit(ctx, &join.channel, &grant).await {
                        Ok(fresh) => room = fresh,
                        Err(err) => break Err(err),
                    }
                }
                result => break result,
            }
        };
        let previous = match added {
            Ok(previous) => previous,
            Err(err) => {
                peer.close_session();
                if let Err(err) = transport.close().await {
                    tracing::error!("failed to close transport: {}", err);
                }
                room.maybe_cleanup(&ctx.rooms, ctx.media.room_grace_period)
                    .await;
                return Err(err);
            }
        };

        if let Some(previous) = previous {
            previous.send_nowait(Envelope::error("replaced"));
            previous.close_session();
        }

        Self::register_callbacks(&room, &peer).await;

        tracing::info!(
            "User {} joined channel {} (guild {:?}, moved={})",
            grant.user_id,
            room.id,
            grant.guild_id,
            grant.moved
        );

        let session = Self { room, peer };
        session
            .peer
            .send(Envelope::rtc(RtcType::Join, &JoinAck { ok: true }))
            .await;
        session.room.attach_existing_publications(&session.peer).await;
        if let Err(err) = session.peer.send_initial_offer().await {
            tracing::error!(
                "failed to send initial offer to {}: {}",
                session.peer.user_id,
                err
            );
            session.peer.close_session();
        }
        Ok(session)
    }

    // Fetches the room and checks the user may enter it.
    async fn admit(ctx: &SessionContext, channel: &str, grant: &JoinGrant) -> Result<Arc<Room>, Error> {
        let room = ctx.rooms.get_or_create(channel).await;
        let rejection = if room.is_blocked(&grant.user_id).await && !grant.moved {
            Some(Error::new_signaling(
                format!("user {} is blocked in {}", grant.user_id, channel),
                SignalingErrorKind::Blocked,
            ))
        } else if !grant.permissions.allows(Permissions::CONNECT) {
            Some(Error::new_signaling(
                format!("user {} may not connect to {}", grant.user_id, channel),
                SignalingErrorKind::Forbidden,
            ))
        } else {
            None
        };
        match rejection {
            Some(err) => {
                room.maybe_cleanup(&ctx.rooms, ctx.media.room_grace_period)
                    .await;
                Err(err)
            }
            None => Ok(room),
        }
    }

    async fn register_callbacks(room: &Arc<Room>, peer: &Arc<Peer>) {
        let transport = peer.transport.clone();

        let weak_peer = Arc::downgrade(peer);
        transport
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(peer) = weak_peer.upgrade() {
                    peer.send_nowait(Envelope::rtc(
                        RtcType::Candidate,
                        &CandidatePayload::from(candidate),
                    ));
                }
            }))
            .await;

        let weak_peer = Arc::downgrade(peer);
        let weak_room = Arc::downgrade(room);
        transport
            .on_track(Box::new(move |track: Arc<TrackRemote>| {
                let (Some(peer), Some(room)) = (weak_peer.upgrade(), weak_room.upgrade()) else {
                    return;
                };
                tokio::spawn(async move {
                    room.publish_track(&peer, track).await;
                });
            }))
            .await;

        let weak_peer = Arc::downgrade(peer);
        transport
            .on_signaling_stable(Box::new(move || {
                if let Some(peer) = weak_peer.upgrade() {
                    tokio::spawn(async move {
                        peer.resume_pending_negotiation().await;
                    });
                }
            }))
            .await;

        let weak_peer = Arc::downgrade(peer);
        transport
            .on_connection_failed(Box::new(move || {
                if let Some(peer) = weak_peer.upgrade() {
                    tracing::warn!("transport of {} failed", peer.user_id);
                    peer.close_session();
                }
            }))
            .await;
    }

    async fn message_loop<R>(&self, ctx: &SessionContext, incoming: &mut R)
    where
        R: Stream<Item = String> + Unpin + Send,
    {
        let heartbeat_timeout = ctx.session.heartbeat_timeout();
        let deadline: Sleep = tokio::time::sleep(heartbeat_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.peer.closed() => {
                    tracing::debug!("session of {} is closed", self.peer.user_id);
                    break;
                }
                _ = &mut deadline => {
                    tracing::info!("heartbeat of {} timed out", self.peer.user_id);
                    break;
                }
                message = incoming.next() => {
                    let Some(text) = message else {
                        tracing::debug!("socket of {} is closed", self.peer.user_id);
                        break;
                    };
                    let envelope = match Envelope::parse(&text) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            tracing::warn!("{} sent a malformed envelope: {}", self.peer.user_id, err);
                            self.peer.send_nowait(Envelope::error(err.client_message()));
                            break;
                        }
                    };
                    if envelope.kind() == MessageKind::Heartbeat {
                        deadline.as_mut().reset(Instant::now() + heartbeat_timeout);
                        let heartbeat: HeartbeatPayload = envelope.payload().unwrap_or_default();
                        self.peer.send_nowait(Envelope::pong(heartbeat));
                        continue;
                    }
                    match self.dispatch(envelope).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(err) => {
                            if matches!(err.kind, ErrorKind::TransportError(TransportErrorKind::SignalingStateInvalid)) {
                                tracing::warn!("{} sent out of order sdp: {}", self.peer.user_id, err);
                                continue;
                            }
                            tracing::error!("session of {} failed: {}", self.peer.user_id, err);
                            self.peer.send_nowait(Envelope::error(err.client_message()));
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<Flow, Error> {
        let t = match envelope.kind() {
            MessageKind::Rtc(t) => t,
            MessageKind::Heartbeat => return Ok(Flow::Continue),
            MessageKind::Unknown { op, t } => {
                tracing::debug!("ignoring unknown message op={} t={}", op, t);
                return Ok(Flow::Continue);
            }
        };

        match t {
            RtcType::Offer => {
                let offer: SdpPayload = envelope.payload()?;
                self.peer.handle_remote_offer(offer.sdp).await?;
            }
            RtcType::Answer => {
                let answer: SdpPayload = envelope.payload()?;
                self.peer.handle_answer(answer.sdp).await?;
            }
            RtcType::Candidate => {
                let candidate: CandidatePayload = envelope.payload()?;
                if let Err(err) = self.peer.add_ice_candidate(candidate.into()).await {
                    tracing::warn!("failed to add candidate of {}: {}", self.peer.user_id, err);
                }
            }
            RtcType::MuteSelf => {
                let mute: MuteSelfPayload = envelope.payload()?;
                self.peer.set_self_muted(mute.muted);
                tracing::debug!("{} self mute is {}", self.peer.user_id, mute.muted);
            }
            RtcType::MuteUser => {
                let mute: MuteUserPayload = envelope.payload()?;
                if mute.user != self.peer.user_id && self.peer.set_user_muted(&mute.user, mute.muted) {
                    self.room.resync_peer_subscriptions(&self.peer.user_id).await;
                }
            }
            RtcType::ServerMuteUser => {
                if !self.permitted(Permissions::MUTE_MEMBERS, t) {
                    return Ok(Flow::Continue);
                }
                let mute: ServerMutePayload = envelope.payload()?;
                self.room.set_server_muted(&mute.user, mute.muted).await;
            }
            RtcType::ServerDeafenUser => {
                if !self.permitted(Permissions::DEAFEN_MEMBERS, t) {
                    return Ok(Flow::Continue);
                }
                let deafen: ServerDeafenPayload = envelope.payload()?;
                self.room
                    .set_server_deafened(&deafen.user, deafen.deafened)
                    .await;
            }
            RtcType::ServerKickUser => {
                if !self.permitted(Permissions::MOVE_MEMBERS, t) {
                    return Ok(Flow::Continue);
                }
                let kick: KickPayload = envelope.payload()?;
                self.force_close(&kick.user, Envelope::error("kicked")).await;
            }
            RtcType::ServerBlockUser => {
                if !self.permitted(Permissions::MOVE_MEMBERS, t) {
                    return Ok(Flow::Continue);
                }
                let block: BlockPayload = envelope.payload()?;
                self.room.set_blocked(&block.user, block.block).await;
                if block.block {
                    self.force_close(&block.user, Envelope::error("blocked")).await;
                }
            }
            RtcType::Moved => {
                if !self.permitted(Permissions::MOVE_MEMBERS, t) {
                    return Ok(Flow::Continue);
                }
                let moved: MovePayload = envelope.payload()?;
                let notice = Envelope::rtc(
                    RtcType::Moved,
                    &MovedPayload {
                        channel: moved.channel,
                    },
                );
                self.force_close(&moved.user, notice).await;
            }
            RtcType::Leave => {
                tracing::debug!("{} leaves", self.peer.user_id);
                return Ok(Flow::Stop);
            }
            RtcType::Join | RtcType::Error => {
                tracing::debug!("ignoring {} from {}", t, self.peer.user_id);
            }
        }
        Ok(Flow::Continue)
    }

    fn permitted(&self, required: Permissions, t: RtcType) -> bool {
        let permitted = self.peer.permissions().allows(required);
        if !permitted {
            tracing::debug!("{} lacks permission for {}", self.peer.user_id, t);
        }
        permitted
    }

    // Notifies the target and ends its session.
    async fn force_close(&self, user_id: &str, notice: Envelope) {
        let Some(target) = self.room.peer(user_id).await else {
            tracing::debug!("{} is not in room {}", user_id, self.room.id);
            return;
        };
        tracing::info!(
            "{} closes the session of {} in room {}",
            self.peer.user_id,
            user_id,
            self.room.id
        );
        // The target's queue may be full, that must not stall this session.
        target.send_nowait(notice);
        target.close_session();
    }

    async fn teardown(self, ctx: &SessionContext) {
        self.room.remove_peer_if(&self.peer).await;
        if let Err(err) = self.peer.transport.close().await {
            tracing::error!("failed to close transport of {}: {}", self.peer.user_id, err);
        }
        self.peer.close_session();
        self.room
            .maybe_cleanup(&ctx.rooms, ctx.media.room_grace_period)
            .await;
        tracing::info!("User {} left channel {}", self.peer.user_id, self.room.id);
    }
}
