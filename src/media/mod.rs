//! Real-time media pacing (spec.md §4.2–§4.3, §6): decode container/HTTP
//! streams to PCM/YUV and deliver them to a `MediaSink` at real-time
//! cadence.

pub mod decoder;
pub mod effects;
pub mod pacer;
pub mod sink;

/// PCM wire format constants (spec.md §6).
pub const PCM_SAMPLE_RATE_HZ: u32 = 48_000;
pub const PCM_CHANNELS: u32 = 1;
pub const PCM_FRAME_MS: u32 = 10;
pub const PCM_SAMPLES_PER_FRAME: usize = 480; // 48000 Hz * 10ms
pub const PCM_BYTES_PER_FRAME: usize = PCM_SAMPLES_PER_FRAME * 2; // S16LE

/// Default video canvas (spec.md §6, configurable).
pub const DEFAULT_VIDEO_WIDTH: u32 = 640;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 360;
pub const DEFAULT_VIDEO_FPS: u32 = 30;

/// Kind discriminator shared by `DecoderJob`/`Pacer`/`MediaSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Bytes of one raw frame at the declared format.
    pub fn frame_bytes(self, video_width: u32, video_height: u32) -> usize {
        match self {
            MediaKind::Audio => PCM_BYTES_PER_FRAME,
            // YUV420p: width*height (Y) + (width/2)*(height/2)*2 (U+V)
            MediaKind::Video => {
                let w = video_width as usize;
                let h = video_height as usize;
                w * h + 2 * ((w + 1) / 2) * ((h + 1) / 2)
            }
        }
    }
}

/// A live media source owned by `VoiceConnection` (spec.md §3
/// `MediaSource`). The audio source exists for the connection's lifetime;
/// the video source exists only while `play_video` is active.
pub struct MediaSource {
    pub kind: MediaKind,
    pub track: crate::rtc::TrackHandle,
}
