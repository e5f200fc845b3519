//! voxmesh-core — the multi-peer voice/media connection core of a chat bot.
//!
//! This crate is the hard engineering underneath a bot joining a voice
//! channel: perfect-negotiation WebRTC signalling (RFC 8829), tiered
//! connection admission for up to 100 concurrent peers, and real-time media
//! pacing of decoded audio/video into a pure mesh of peer connections.
//!
//! The chat gateway transport, the REST API, the underlying WebRTC stack's
//! internals, the external decoder process's internals, message/command
//! handling and caches for servers/channels/members are all treated as thin
//! collaborators outside this crate's scope; see `SPEC_FULL.md`.

pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod rtc;
pub mod signalling;
pub mod voice;

pub use clock::{FrameClock, SystemClock};
pub use config::{IceServerConfig, VoiceConnectionConfig};
pub use error::{DecoderError, SignallingError, VoiceError};
pub use voice::connection::{PlaybackEvent, VideoSourceKind, VoiceConnection};
pub use voice::peer::PeerSession;

/// Installs a `tracing` subscriber reading `RUST_LOG` (or `voxmesh_core=info`
/// by default), with JSON output when `VOXMESH_LOG_JSON=1`.
///
/// This is a convenience for binaries embedding this crate; the crate itself
/// never installs a global subscriber.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("voxmesh_core=info,warn"));

    let json = std::env::var("VOXMESH_LOG_JSON")
        .map(|v| v == "1")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
