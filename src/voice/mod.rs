//! Orchestration layer: per-peer negotiation, admission control, and the
//! top-level `VoiceConnection` that owns both plus the media pipeline.

pub mod admission;
pub mod connection;
pub mod peer;
