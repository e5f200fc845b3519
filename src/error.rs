//! Error taxonomy for the voice core.
//!
//! Mirrors the shape of the teacher's `voice::error::VoiceError`: one
//! `thiserror` enum per subsystem boundary, with `#[from]` conversions from
//! the external crates we wrap.

/// Errors surfaced across `PeerSession` / `VoiceConnection` boundaries.
///
/// `peer` fields are the signalling bus's own peer ID strings (e.g.
/// `"bot-1"`, `"user-42"`), not UUIDs — the signalling bus defines peer
/// identity, and spec.md's own worked examples use plain strings for it.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// The signalling bus is unavailable; the transport adapter retries on
    /// its own and this only surfaces if retries are exhausted or the
    /// channel closes permanently.
    #[error("signalling transport disconnected")]
    TransportDisconnected,

    /// The underlying WebRTC stack refused to construct a peer connection.
    #[error("failed to build peer connection for {peer}: {source}")]
    PeerConnectionBuild {
        peer: String,
        source: webrtc::Error,
    },

    /// An offer/answer/ICE-candidate operation threw. The caller is
    /// expected to set `pending_renegotiate` and retry on the next `STABLE`
    /// transition rather than propagate this further.
    #[error("negotiation failed for {peer}: {message}")]
    NegotiationFailed { peer: String, message: String },

    /// Admission was rejected because `max_connected_peers` is reached and
    /// the peer is not priority. Silent by policy (log only, never
    /// user-visible) — see `VoiceError::is_silent`.
    #[error("capacity exceeded admitting {peer}")]
    CapacityExceeded { peer: String },

    /// Duplicate admission, or a negotiation already in flight for this
    /// peer. Silent by policy.
    #[error("{peer} already has an active session or queue entry")]
    AlreadyActive { peer: String },

    /// No peer could be admitted within the configured window, or a
    /// non-recoverable decoder error occurred. The only orchestrator-level
    /// failure that is actually user-visible (spec.md §7).
    #[error("voice connection failed: {0}")]
    Internal(String),

    #[error(transparent)]
    Decoder(#[from] DecoderError),

    #[error(transparent)]
    Signalling(#[from] SignallingError),
}

impl VoiceError {
    /// Errors that spec.md §7 marks "silent (log only)" and that must never
    /// be surfaced to the bot framework as a user-visible failure.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            VoiceError::CapacityExceeded { .. } | VoiceError::AlreadyActive { .. }
        )
    }
}

impl From<webrtc::Error> for VoiceError {
    fn from(err: webrtc::Error) -> Self {
        VoiceError::Internal(err.to_string())
    }
}

/// Errors from the signalling transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum SignallingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to serialize signalling event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("signalling channel closed")]
    Closed,
}

/// Errors from `MediaDecoder` subprocess supervision.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// The decoder produced no output frames. Retried up to three times
    /// for HTTP inputs with exponential back-off; surfaced otherwise.
    #[error("decoder exited with no output frames: {last_stderr}")]
    ExitedEmpty { last_stderr: String },

    /// The subprocess could not be spawned at all (binary missing,
    /// permission denied, ...). Same retry policy as `ExitedEmpty`.
    #[error("failed to spawn decoder: {0}")]
    SpawnFailed(String),

    /// The input file does not exist. Immediate error, no retry.
    #[error("input file not found: {0}")]
    FileMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
