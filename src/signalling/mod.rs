//! The chat gateway's `voice:*` events (spec.md §6), treated as an opaque
//! asynchronous transport. Event shapes mirror the teacher's
//! `ClientEvent`/`ServerEvent` tagged-enum idiom
//! (`client/src-tauri/src/network/websocket.rs`), generalized from the
//! teacher's chat-specific variants to the voice-signalling set spec.md
//! names.

pub mod gateway;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Events this endpoint sends to the signalling bus (spec.md §6, "Events
/// sent by the endpoint").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundSignal {
    #[serde(rename = "voice:join")]
    Join {
        channel_id: String,
        server_id: String,
        peer_id: String,
    },
    #[serde(rename = "voice:leave")]
    Leave { channel_id: String },
    #[serde(rename = "voice:heartbeat")]
    Heartbeat { channel_id: String },
    #[serde(rename = "voice:offer")]
    Offer {
        to: String,
        offer: RTCSessionDescription,
        channel_id: String,
    },
    #[serde(rename = "voice:answer")]
    Answer {
        to: String,
        answer: RTCSessionDescription,
        channel_id: String,
    },
    #[serde(rename = "voice:ice-candidate")]
    IceCandidate {
        to: String,
        candidate: RTCIceCandidateInit,
        channel_id: String,
    },
    #[serde(rename = "voice:peer-state-report")]
    PeerStateReport {
        channel_id: String,
        target_peer_id: String,
        state: String,
        timestamp: i64,
    },
    #[serde(rename = "voice:video")]
    VideoState {
        channel_id: String,
        user_id: String,
        enabled: bool,
    },
}

/// `voice:user-joined`/`voice:user-left` accept either `id` or `userId`
/// (spec.md §9 Open Question #1 — "the source alternately uses ... `id` and
/// `userId`; implementations must accept either").
#[derive(Debug, Clone, Deserialize)]
pub struct PeerIdPayload {
    #[serde(alias = "userId")]
    pub id: String,
}

/// Events this endpoint receives from the signalling bus (spec.md §6,
/// "Events received").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundSignal {
    #[serde(rename = "voice:participants")]
    Participants {
        channel_id: String,
        participants: Vec<String>,
    },
    #[serde(rename = "voice:user-joined")]
    UserJoined {
        channel_id: String,
        #[serde(flatten)]
        peer: PeerIdPayload,
    },
    #[serde(rename = "voice:user-left")]
    UserLeft {
        channel_id: String,
        #[serde(flatten)]
        peer: PeerIdPayload,
    },
    #[serde(rename = "voice:offer")]
    Offer {
        from: String,
        offer: RTCSessionDescription,
        channel_id: String,
    },
    #[serde(rename = "voice:answer")]
    Answer {
        from: String,
        answer: RTCSessionDescription,
        channel_id: String,
    },
    #[serde(rename = "voice:ice-candidate")]
    IceCandidate {
        from: String,
        candidate: RTCIceCandidateInit,
        channel_id: String,
    },
    #[serde(rename = "voice:force-reconnect")]
    ForceReconnect {
        channel_id: String,
        reason: String,
        target_peer: String,
    },
    #[serde(rename = "voice:resync-request")]
    ResyncRequest { from: String, channel_id: String },
}

impl InboundSignal {
    /// The channel this event is scoped to. "Any event bearing a
    /// `channelId` that does not match the local one is dropped" (spec.md
    /// §6).
    pub fn channel_id(&self) -> &str {
        match self {
            InboundSignal::Participants { channel_id, .. }
            | InboundSignal::UserJoined { channel_id, .. }
            | InboundSignal::UserLeft { channel_id, .. }
            | InboundSignal::Offer { channel_id, .. }
            | InboundSignal::Answer { channel_id, .. }
            | InboundSignal::IceCandidate { channel_id, .. }
            | InboundSignal::ForceReconnect { channel_id, .. }
            | InboundSignal::ResyncRequest { channel_id, .. } => channel_id,
        }
    }
}

/// Abstraction over the chat gateway (spec.md §9: "the signalling bus is
/// equally abstract: `send(event, payload)` plus typed subscriptions").
pub trait SignallingTransport: Send + Sync + 'static {
    fn send(&self, event: OutboundSignal) -> BoxFuture<'_, Result<(), crate::error::SignallingError>>;

    /// Takes ownership of the inbound event stream. Called exactly once by
    /// `VoiceConnection::join`.
    fn take_inbound(&self) -> tokio::sync::mpsc::UnboundedReceiver<InboundSignal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_joined_accepts_id_or_user_id() {
        let by_id: InboundSignal = serde_json::from_str(
            r#"{"type":"voice:user-joined","channel_id":"c1","id":"p1"}"#,
        )
        .unwrap();
        let by_user_id: InboundSignal = serde_json::from_str(
            r#"{"type":"voice:user-joined","channel_id":"c1","userId":"p1"}"#,
        )
        .unwrap();

        let InboundSignal::UserJoined { peer: p1, .. } = by_id else {
            panic!("expected UserJoined")
        };
        let InboundSignal::UserJoined { peer: p2, .. } = by_user_id else {
            panic!("expected UserJoined")
        };
        assert_eq!(p1.id, "p1");
        assert_eq!(p2.id, "p1");
    }

    #[test]
    fn channel_id_accessor_covers_all_variants() {
        let event: InboundSignal = serde_json::from_str(
            r#"{"type":"voice:resync-request","channel_id":"c9","from":"p1"}"#,
        )
        .unwrap();
        assert_eq!(event.channel_id(), "c9");
    }
}
