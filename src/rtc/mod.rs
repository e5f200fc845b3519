//! The narrow WebRTC capability set spec.md §9 calls for: "any
//! implementation that offers these can be substituted." `PeerSession`
//! (`voice/peer.rs`) is generic over `PeerConnection` so perfect-negotiation
//! logic can be driven deterministically against `mock::MockPeerConnection`
//! in tests, and against `live::LivePeerConnection` (backed by the `webrtc`
//! crate, built the way the teacher's `voice::sfu::SfuServer::new()` builds
//! its `MediaEngine`/`API`) in production.

pub mod live;
pub mod mock;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::TrackLocal;
use std::sync::Arc;

/// A track this crate can hand to a `PeerConnection::add_track`/
/// `replace_track` call. Shared across every peer's connection — "the
/// orchestrator holds the exclusive write capability; PeerSessions read
/// metadata only" (spec.md §5).
pub type TrackHandle = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// The union of observable events spec.md §9 lists: `ice_candidate`,
/// `connection_state`, `signalling_state`, `negotiation_needed`,
/// `ice_connection_state`.
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    NegotiationNeeded,
    IceCandidate(RTCIceCandidateInit),
    ConnectionStateChange(RTCPeerConnectionState),
    SignalingStateChange(RTCSignalingState),
    IceConnectionStateChange(RTCIceConnectionState),
}

/// The capability set `PeerSession` drives. Every async method matches a
/// WebRTC standard operation 1:1 so the perfect-negotiation state machine
/// reads the same whether it runs against `webrtc`-rs or a test double.
pub trait PeerConnection: Send + Sync + 'static {
    fn create_offer(&self, ice_restart: bool) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>>;

    fn create_answer(&self) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>>;

    fn set_local_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn set_remote_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn add_track(&self, kind: TrackKind, track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn replace_track(&self, kind: TrackKind, track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn remove_track(&self, kind: TrackKind) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn close(&self) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn signaling_state(&self) -> RTCSignalingState;

    fn ice_connection_state(&self) -> RTCIceConnectionState;

    /// Takes ownership of this connection's event stream. May only be
    /// called once per connection instance — `PeerSession` owns exactly one
    /// consumer, matching spec.md §9's "message passing only" ownership
    /// rule (no second reader could make sense of interleaved negotiation
    /// events anyway).
    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerConnectionEvent>;
}

/// Builds fresh `PeerConnection`s. `VoiceConnection` holds one factory for
/// the lifetime of the voice channel and asks it for a new connection per
/// admitted peer, and again whenever a session's connection is rebuilt in
/// place after `closed`/`failed` (spec.md §3).
pub trait PeerConnectionFactory: Send + Sync + 'static {
    type Connection: PeerConnection;

    fn build(&self) -> BoxFuture<'_, Result<Self::Connection, webrtc::Error>>;
}
