#![deny(missing_debug_implementations)]
//! # voicemesh
//! A selective forwarding unit for voice channels. Clients join a room over a JSON signaling
//! socket, publish their microphone or camera over WebRTC, and receive every other member's
//! tracks without any transcoding on the server.
//!
//! The server binary wires [`server::router`] to a [`room_manager::RoomManager`]; everything
//! below it can also be embedded.

pub mod config;
/// Periodic load report to the routing registry.
pub mod discovery;
pub mod error;
/// A connected user and its renegotiation state.
pub mod peer;
pub mod permissions;
/// One published track and the loop forwarding it to subscribers.
pub mod publication;
/// Membership, publications and moderation state of one voice channel.
pub mod room;
pub mod room_manager;
/// SDP rewriting applied to every server offer.
pub mod sdp;
pub mod server;
/// The signaling socket protocol.
pub mod signaling;
/// Join token validation.
pub mod token;
/// [`webrtc::peer_connection::RTCPeerConnection`] wrapper used for both directions.
pub mod transport;
pub(crate) mod utils;
