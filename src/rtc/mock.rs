//! In-memory `PeerConnection` test double.
//!
//! The teacher has no equivalent (its tests run against a real Postgres/
//! Redis test-container per `config.rs::default_for_test`'s doc comment);
//! this is enriched from ordinary Rust trait-mocking practice so the
//! perfect-negotiation state machine in `voice/peer.rs` can be driven
//! deterministically without a real ICE/DTLS handshake. It implements just
//! enough of the WebRTC signalling-state machine (RFC 8829 §4.1.1) to
//! exercise collision/rollback paths correctly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{PeerConnection, PeerConnectionEvent, PeerConnectionFactory, TrackHandle, TrackKind};

/// A call recorded for test assertions, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(RTCSdpType),
    SetRemote(RTCSdpType),
    AddIceCandidate,
    AddTrack(TrackKind),
    ReplaceTrack(TrackKind),
    RemoveTrack(TrackKind),
    Close,
}

pub struct MockPeerConnection {
    id: u32,
    signaling_state: Mutex<RTCSignalingState>,
    ice_state: Mutex<RTCIceConnectionState>,
    closed: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    event_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    events_taken: AtomicBool,
}

impl MockPeerConnection {
    fn new(id: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            signaling_state: Mutex::new(RTCSignalingState::Stable),
            ice_state: Mutex::new(RTCIceConnectionState::New),
            closed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
            events_taken: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn signaling_state_now(&self) -> RTCSignalingState {
        *self.signaling_state.lock().unwrap()
    }

    /// Test hook: simulates the ICE layer reaching `connected`, as the real
    /// `webrtc` crate would after a successful handshake.
    pub fn simulate_connected(&self) {
        *self.ice_state.lock().unwrap() = RTCIceConnectionState::Connected;
        let _ = self
            .event_tx
            .send(PeerConnectionEvent::IceConnectionStateChange(RTCIceConnectionState::Connected));
        let _ = self
            .event_tx
            .send(PeerConnectionEvent::ConnectionStateChange(RTCPeerConnectionState::Connected));
    }

    pub fn simulate_failed(&self) {
        *self.ice_state.lock().unwrap() = RTCIceConnectionState::Failed;
        let _ = self
            .event_tx
            .send(PeerConnectionEvent::IceConnectionStateChange(RTCIceConnectionState::Failed));
    }

    pub fn simulate_negotiation_needed(&self) {
        let _ = self.event_tx.send(PeerConnectionEvent::NegotiationNeeded);
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fake_sdp(kind: RTCSdpType) -> RTCSessionDescription {
        match kind {
            RTCSdpType::Offer => RTCSessionDescription::offer("v=0\r\no=mock offer\r\n".to_string())
                .expect("valid mock offer"),
            RTCSdpType::Answer => RTCSessionDescription::answer("v=0\r\no=mock answer\r\n".to_string())
                .expect("valid mock answer"),
            RTCSdpType::Rollback => {
                let mut desc = RTCSessionDescription::default();
                desc.sdp_type = RTCSdpType::Rollback;
                desc.sdp = String::new();
                desc
            }
            other => panic!("fake_sdp: unsupported sdp type {other:?}"),
        }
    }
}

impl PeerConnection for MockPeerConnection {
    fn create_offer(&self, ice_restart: bool) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>> {
        self.record(RecordedCall::CreateOffer { ice_restart });
        Box::pin(async move { Ok(Self::fake_sdp(RTCSdpType::Offer)) })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>> {
        self.record(RecordedCall::CreateAnswer);
        Box::pin(async move { Ok(Self::fake_sdp(RTCSdpType::Answer)) })
    }

    fn set_local_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::SetLocal(desc.sdp_type));
        Box::pin(async move {
            let mut state = self.signaling_state.lock().unwrap();
            *state = match (*state, desc.sdp_type) {
                (RTCSignalingState::Stable, RTCSdpType::Offer) => RTCSignalingState::HaveLocalOffer,
                (RTCSignalingState::HaveRemoteOffer, RTCSdpType::Answer) => RTCSignalingState::Stable,
                (RTCSignalingState::HaveLocalOffer, RTCSdpType::Rollback) => RTCSignalingState::Stable,
                (other, RTCSdpType::Rollback) => other,
                (other, kind) => {
                    return Err(webrtc::Error::new(format!(
                        "mock: invalid set_local_description({kind:?}) from state {other:?}"
                    )))
                }
            };
            let _ = self
                .event_tx
                .send(PeerConnectionEvent::SignalingStateChange(*state));
            Ok(())
        })
    }

    fn set_remote_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::SetRemote(desc.sdp_type));
        Box::pin(async move {
            let mut state = self.signaling_state.lock().unwrap();
            *state = match (*state, desc.sdp_type) {
                (RTCSignalingState::Stable, RTCSdpType::Offer) => RTCSignalingState::HaveRemoteOffer,
                (RTCSignalingState::HaveLocalOffer, RTCSdpType::Answer) => RTCSignalingState::Stable,
                (other, kind) => {
                    return Err(webrtc::Error::new(format!(
                        "mock: invalid set_remote_description({kind:?}) from state {other:?}"
                    )))
                }
            };
            let _ = self
                .event_tx
                .send(PeerConnectionEvent::SignalingStateChange(*state));
            Ok(())
        })
    }

    fn add_ice_candidate(&self, _candidate: RTCIceCandidateInit) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::AddIceCandidate);
        Box::pin(async move { Ok(()) })
    }

    fn add_track(&self, kind: TrackKind, _track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::AddTrack(kind));
        Box::pin(async move { Ok(()) })
    }

    fn replace_track(&self, kind: TrackKind, _track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::ReplaceTrack(kind));
        Box::pin(async move { Ok(()) })
    }

    fn remove_track(&self, kind: TrackKind) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::RemoveTrack(kind));
        Box::pin(async move { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        self.record(RecordedCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async move { Ok(()) })
    }

    fn signaling_state(&self) -> RTCSignalingState {
        *self.signaling_state.lock().unwrap()
    }

    fn ice_connection_state(&self) -> RTCIceConnectionState {
        *self.ice_state.lock().unwrap()
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerConnectionEvent> {
        if self.events_taken.swap(true, Ordering::SeqCst) {
            panic!("MockPeerConnection::take_events called more than once");
        }
        self.event_rx.lock().unwrap().take().expect("events receiver already taken")
    }
}

/// Builds sequentially-numbered `MockPeerConnection`s; the number is only
/// useful for log messages in tests.
#[derive(Default)]
pub struct MockFactory {
    next_id: AtomicU32,
}

impl PeerConnectionFactory for MockFactory {
    type Connection = MockPeerConnection;

    fn build(&self) -> BoxFuture<'_, Result<Self::Connection, webrtc::Error>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(MockPeerConnection::new(id)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_answer_reaches_stable() {
        let factory = MockFactory::default();
        let pc = factory.build().await.unwrap();

        let offer = pc.create_offer(false).await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        assert_eq!(pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        let answer = RTCSessionDescription::answer("v=0\r\n".to_string()).unwrap();
        pc.set_remote_description(answer).await.unwrap();
        assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn rollback_returns_to_stable() {
        let factory = MockFactory::default();
        let pc = factory.build().await.unwrap();

        let offer = pc.create_offer(false).await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        assert_eq!(pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = String::new();
        pc.set_local_description(rollback).await.unwrap();
        assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
    }
}
