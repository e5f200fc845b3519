//! `MediaSink`: the pushable endpoint a `Pacer` writes decoded frames into
//! (spec.md §3 `MediaSource`, §4.3).
//!
//! Grounded on the teacher's `client/src-tauri/src/audio/handle.rs`, which
//! wraps a raw PCM producer behind a narrow push method so the decode task
//! never has to know about the playback backend; here the "playback
//! backend" is a WebRTC `TrackLocalStaticSample`, written the way
//! `voice/sfu.rs` constructs its outbound tracks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::media::{MediaKind, DEFAULT_VIDEO_FPS, PCM_FRAME_MS};

/// Where a `Pacer` delivers paced frames (spec.md §4.3: "the pacer owns
/// timing; it knows nothing about delivery"). Implementors must be cheap to
/// call at frame cadence — no internal locking beyond what the track itself
/// requires.
pub trait MediaSink: Send + Sync + 'static {
    fn on_pcm_frame(&self, frame: &[u8]) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    fn on_yuv_frame(&self, frame: &[u8], fps: u32) -> BoxFuture<'_, Result<(), webrtc::Error>>;

    /// Total frames accepted so far, for `frames_sent` telemetry (spec.md
    /// §8 testable property: "`frames_sent` is monotonically
    /// non-decreasing").
    fn frames_sent(&self) -> u64;
}

/// Writes frames straight to a `TrackLocalStaticSample`, the shape every
/// `PeerConnection::add_track` call in this crate expects (spec.md §5: "all
/// PeerSessions share one audio `MediaSource` and, while active, one video
/// `MediaSource`").
pub struct TrackSink {
    track: std::sync::Arc<TrackLocalStaticSample>,
    frames_sent: AtomicU64,
}

impl TrackSink {
    pub fn new(track: std::sync::Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            frames_sent: AtomicU64::new(0),
        }
    }
}

impl MediaSink for TrackSink {
    fn on_pcm_frame(&self, frame: &[u8]) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        let sample = Sample {
            data: frame.to_vec().into(),
            duration: Duration::from_millis(u64::from(PCM_FRAME_MS)),
            ..Default::default()
        };
        Box::pin(async move {
            self.track.write_sample(&sample).await?;
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn on_yuv_frame(&self, frame: &[u8], fps: u32) -> BoxFuture<'_, Result<(), webrtc::Error>> {
        let fps = if fps == 0 { DEFAULT_VIDEO_FPS } else { fps };
        let sample = Sample {
            data: frame.to_vec().into(),
            duration: Duration::from_millis(1000 / u64::from(fps)),
            ..Default::default()
        };
        Box::pin(async move {
            self.track.write_sample(&sample).await?;
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Routes a frame to the sink matching `kind`, logging and swallowing a
/// write failure rather than tearing down the pacer loop over one dropped
/// sample (spec.md §7: media write errors are non-fatal per frame).
pub async fn write_frame(
    sink: &dyn MediaSink,
    kind: MediaKind,
    frame: &[u8],
    fps: u32,
) {
    let result = match kind {
        MediaKind::Audio => sink.on_pcm_frame(frame).await,
        MediaKind::Video => sink.on_yuv_frame(frame, fps).await,
    };
    if let Err(err) = result {
        warn!(?kind, error = %err, "dropping frame: sink write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn test_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "voxmesh".to_string(),
        ))
    }

    #[tokio::test]
    async fn pcm_frame_increments_counter_even_with_no_subscribers() {
        let sink = TrackSink::new(test_track());
        sink.on_pcm_frame(&[0u8; crate::media::PCM_BYTES_PER_FRAME])
            .await
            .unwrap();
        assert_eq!(sink.frames_sent(), 1);
    }
}
