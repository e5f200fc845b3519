//! `webrtc`-crate-backed `PeerConnection`/`PeerConnectionFactory`.
//!
//! The `MediaEngine`/`API`/interceptor-registry construction mirrors the
//! teacher's `voice::sfu::SfuServer::new()` almost exactly (same codecs,
//! same payload types) since both are building a mesh endpoint that must
//! speak the same SDP the teacher's SFU already negotiates successfully
//! against browsers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::{PeerConnection, PeerConnectionEvent, PeerConnectionFactory, TrackHandle, TrackKind};
use crate::config::IceServerConfig;

/// Builds the shared `API` once per `VoiceConnection` — codec registration
/// and interceptor setup are expensive enough that they should not be
/// repeated per peer (the teacher's `SfuServer::new()` builds exactly one
/// `API` and reuses it for every `Room`/`Peer`).
pub fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn rtc_configuration(ice: &IceServerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

pub struct LiveFactory {
    api: Arc<API>,
    config: RTCConfiguration,
}

impl LiveFactory {
    pub fn new(api: Arc<API>, config: RTCConfiguration) -> Self {
        Self { api, config }
    }
}

impl PeerConnectionFactory for LiveFactory {
    type Connection = LivePeerConnection;

    fn build(&self) -> BoxFuture<'_, Result<Self::Connection, webrtc::Error>> {
        Box::pin(async move {
            let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
            add_sendonly_transceivers(&pc).await?;
            LivePeerConnection::wire(pc)
        })
    }
}

/// Wraps a live `RTCPeerConnection`, forwarding its callback-driven events
/// onto a single `mpsc` channel (the same pattern as the teacher's
/// `on_ice_candidate`/`on_peer_connection_state_change` wiring in
/// `voice/sfu.rs::create_peer`).
pub struct LivePeerConnection {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    events_taken: AtomicBool,
    audio_sender: Mutex<Option<Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>>>,
    video_sender: Mutex<Option<Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>>>,
}

impl LivePeerConnection {
    fn wire(pc: Arc<RTCPeerConnection>) -> Result<Self, webrtc::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let tx_neg = tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx_neg.clone();
            Box::pin(async move {
                let _ = tx.send(PeerConnectionEvent::NegotiationNeeded);
            })
        }));

        let tx_ice = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    let _ = tx.send(PeerConnectionEvent::IceCandidate(init));
                }
            })
        }));

        let tx_conn = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx_conn.clone();
            Box::pin(async move {
                let _ = tx.send(PeerConnectionEvent::ConnectionStateChange(state));
            })
        }));

        let tx_sig = tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let tx = tx_sig.clone();
            Box::pin(async move {
                let _ = tx.send(PeerConnectionEvent::SignalingStateChange(state));
            })
        }));

        let tx_ice_conn = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx_ice_conn.clone();
            Box::pin(async move {
                let _ = tx.send(PeerConnectionEvent::IceConnectionStateChange(state));
            })
        }));

        Ok(Self {
            pc,
            events_rx: Mutex::new(Some(rx)),
            events_taken: AtomicBool::new(false),
            audio_sender: Mutex::new(None),
            video_sender: Mutex::new(None),
        })
    }

    fn sender_slot(&self, kind: TrackKind) -> &Mutex<Option<Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>>> {
        match kind {
            TrackKind::Audio => &self.audio_sender,
            TrackKind::Video => &self.video_sender,
        }
    }
}

impl PeerConnection for LivePeerConnection {
    fn create_offer(&self, ice_restart: bool) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>> {
        Box::pin(async move {
            self.pc
                .create_offer(Some(webrtc::peer_connection::offer_answer_options::RTCOfferOptions {
                    ice_restart,
                    voice_activity_detection: false,
                }))
                .await
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<RTCSessionDescription, webrtc::Error>> {
        Box::pin(async move { self.pc.create_answer(None).await })
    }

    fn set_local_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move { self.pc.set_local_description(desc).await })
    }

    fn set_remote_description(&self, desc: RTCSessionDescription) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move { self.pc.set_remote_description(desc).await })
    }

    fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move { self.pc.add_ice_candidate(candidate).await })
    }

    fn add_track(&self, kind: TrackKind, track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move {
            let sender = self.pc.add_track(track).await?;
            *self.sender_slot(kind).lock().unwrap() = Some(sender);
            Ok(())
        })
    }

    fn replace_track(&self, kind: TrackKind, track: TrackHandle) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move {
            let existing = self.sender_slot(kind).lock().unwrap().clone();
            if let Some(sender) = existing {
                sender.replace_track(Some(track)).await
            } else {
                self.add_track(kind, track).await
            }
        })
    }

    fn remove_track(&self, kind: TrackKind) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move {
            let existing = self.sender_slot(kind).lock().unwrap().take();
            if let Some(sender) = existing {
                self.pc.remove_track(&sender).await?;
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        Box::pin(async move { self.pc.close().await })
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.pc.ice_connection_state()
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerConnectionEvent> {
        if self.events_taken.swap(true, Ordering::SeqCst) {
            panic!("LivePeerConnection::take_events called more than once");
        }
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("events receiver already taken")
    }
}

/// Adds the two recv-disabled, send-only transceivers a mesh bot needs up
/// front (it never receives media from peers), reusing the teacher's
/// `add_transceiver_from_kind` call shape from `voice/sfu.rs::create_peer`.
pub async fn add_sendonly_transceivers(pc: &RTCPeerConnection) -> Result<(), webrtc::Error> {
    pc.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        }),
    )
    .await?;
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        }),
    )
    .await?;
    Ok(())
}
