//! `Pacer` (spec.md §4.3): drains a `MediaDecoder`'s `FrameRing` at
//! real-time cadence and writes each frame into a `MediaSink`, correcting
//! for scheduler jitter with a bounded catch-up window.
//!
//! The periodic-tick-plus-drift-correction shape is grounded on the
//! teacher's `client/src-tauri/src/audio/handle.rs` playback loop (a
//! `tokio::select!` over a `tokio::time::interval` and a shutdown signal);
//! the catch-up clamp, stutter detection and hybrid position reporting have
//! no teacher counterpart and are built fresh from spec.md §4.3.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::{CancelToken, FrameClock};
use crate::media::decoder::FrameRing;
use crate::media::sink::{write_frame, MediaSink};
use crate::media::MediaKind;

/// How many consecutive frame periods the pacer may burn through in one
/// tick to catch up on a backlog, before it accepts the drift (spec.md
/// §4.3 "max_catchup" table).
fn max_catchup(kind: MediaKind, is_http_stream: bool) -> u32 {
    match (kind, is_http_stream) {
        (MediaKind::Video, _) => 2,
        (MediaKind::Audio, true) => 3,
        (MediaKind::Audio, false) => 1,
    }
}

/// How long the pacer reports wall-clock-derived position before switching
/// to frame-count-derived position (spec.md §4.3: "the first three seconds
/// of playback").
const HYBRID_POSITION_WINDOW: Duration = Duration::from_secs(3);

/// Throttle for the target-buffer drop warning, matching the decoder's own
/// ring-overflow drop-log throttle.
const TARGET_BUFFER_DROP_LOG_THROTTLE: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Priming,
    Paused,
    Running,
    Stopped,
}

/// Buffer occupancy and health snapshot (spec.md §4.3 `buffer_status`).
#[derive(Debug, Clone, Copy)]
pub struct BufferStatus {
    pub buffered_frames: usize,
    pub frames_sent: u64,
    pub stutter_count: u64,
    pub target_fps: u32,
    pub avg_interval: Duration,
}

/// Reported playback position (spec.md §4.3 `position`).
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub elapsed: Duration,
    pub frames_emitted: u64,
}

/// One paced media stream. `VoiceConnection` owns one `Pacer` per active
/// `MediaSource` and coordinates their start via `unpause`'s shared barrier
/// instant.
pub struct Pacer<C: FrameClock> {
    kind: MediaKind,
    frame_period: Duration,
    clock: Arc<C>,
    frames: Arc<FrameRing>,
    sink: Arc<dyn MediaSink>,
    ring_capacity: usize,
    is_http_stream: bool,
    fps: u32,

    state: watch::Sender<RunState>,
    frames_emitted: Arc<AtomicU64>,
    started_at_ms: Arc<AtomicU64>,
    stutter_count: Arc<AtomicU64>,
    /// Rolling average inter-emission interval, in microseconds (spec.md
    /// §4.3 `avg_interval`). Updated with a simple exponential moving
    /// average each tick rather than a full window, since only the
    /// steady-state trend is reported.
    avg_interval_us: Arc<AtomicU64>,
    cancel: CancelToken,
    stopped: Arc<AtomicBool>,
}

impl<C: FrameClock + 'static> Pacer<C> {
    pub fn new(
        kind: MediaKind,
        clock: Arc<C>,
        frames: Arc<FrameRing>,
        sink: Arc<dyn MediaSink>,
        ring_capacity: usize,
        is_http_stream: bool,
        fps: u32,
    ) -> Self {
        let frame_period = match kind {
            MediaKind::Audio => Duration::from_millis(u64::from(crate::media::PCM_FRAME_MS)),
            MediaKind::Video => {
                let fps = if fps == 0 { crate::media::DEFAULT_VIDEO_FPS } else { fps };
                Duration::from_millis(1000 / u64::from(fps))
            }
        };

        let (state_tx, _) = watch::channel(RunState::Priming);

        Self {
            kind,
            frame_period,
            clock,
            frames,
            sink,
            ring_capacity,
            is_http_stream,
            fps,
            state: state_tx,
            frames_emitted: Arc::new(AtomicU64::new(0)),
            started_at_ms: Arc::new(AtomicU64::new(0)),
            stutter_count: Arc::new(AtomicU64::new(0)),
            avg_interval_us: Arc::new(AtomicU64::new(0)),
            cancel: CancelToken::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Readies the pacer to run but does not start emitting frames
    /// (spec.md §4.3: separates decode warm-up from playback start so an
    /// A/V barrier can be computed before either stream emits its first
    /// frame).
    pub fn prime(&self) {
        let _ = self.state.send(RunState::Priming);
    }

    /// Starts emitting frames. `barrier` is an absolute clock instant (from
    /// `FrameClock::now()`'s timeline) the orchestrator computed so that
    /// audio and video both start at the same wall-clock moment; pass
    /// `None` for a stream with no sibling to coordinate against.
    pub fn unpause(self: &Arc<Self>, barrier: Option<std::time::Instant>) {
        let this = self.clone();
        this.started_at_ms.store(0, Ordering::SeqCst);
        let _ = this.state.send(RunState::Running);
        tokio::spawn(async move {
            if let Some(barrier) = barrier {
                let now = this.clock.now();
                if barrier > now {
                    this.clock.sleep(barrier - now).await;
                }
            }
            this.run_loop().await;
        });
    }

    pub fn pause(&self) {
        let _ = self.state.send(RunState::Paused);
    }

    pub fn stop(&self) {
        let _ = self.state.send(RunState::Stopped);
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Resets the hybrid position window and, when an audio position is
    /// supplied, seeks `frames_emitted` to the equivalent frame index so a
    /// video pacer can realign to where the audio pacer already is (spec.md
    /// §4.3 "resync(audio_position?)" / §8 scenario 6's mid-playback join).
    /// With no position, `frames_emitted` simply resets to zero.
    pub fn resync(&self, audio_position: Option<Duration>) {
        let seek_frames = audio_position
            .map(|pos| (pos.as_nanos() / self.frame_period.as_nanos().max(1)) as u64)
            .unwrap_or(0);
        self.frames_emitted.store(seek_frames, Ordering::SeqCst);
        self.started_at_ms.store(0, Ordering::SeqCst);
        debug!(?audio_position, seek_frames, "pacer resynced");
    }

    pub fn buffer_status(&self) -> BufferStatus {
        BufferStatus {
            buffered_frames: self.frames.len(),
            frames_sent: self.frames_emitted.load(Ordering::SeqCst),
            stutter_count: self.stutter_count.load(Ordering::SeqCst),
            target_fps: self.target_fps(),
            avg_interval: Duration::from_micros(self.avg_interval_us.load(Ordering::SeqCst)),
        }
    }

    fn target_fps(&self) -> u32 {
        match self.kind {
            MediaKind::Audio => 1000 / u32::try_from(self.frame_period.as_millis()).unwrap_or(10),
            MediaKind::Video => {
                if self.fps == 0 {
                    crate::media::DEFAULT_VIDEO_FPS
                } else {
                    self.fps
                }
            }
        }
    }

    /// Hybrid position report: wall-clock derived for the first three
    /// seconds (smooth even under decode jitter), then frame-count derived
    /// (immune to `FrameClock` drift over a long session).
    pub fn position(&self) -> Position {
        let emitted = self.frames_emitted.load(Ordering::SeqCst);
        let frame_derived = self.frame_period * u32::try_from(emitted).unwrap_or(u32::MAX);

        let started_ms = self.started_at_ms.load(Ordering::SeqCst);
        let elapsed = if started_ms == 0 {
            Duration::ZERO
        } else {
            let now_ms = to_millis(self.clock.now());
            Duration::from_millis(now_ms.saturating_sub(started_ms))
        };

        let use_wallclock = elapsed < HYBRID_POSITION_WINDOW;
        Position {
            elapsed: if use_wallclock { elapsed } else { frame_derived },
            frames_emitted: emitted,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        self.started_at_ms.store(to_millis(self.clock.now()), Ordering::SeqCst);
        let max_catchup = max_catchup(self.kind, self.is_http_stream);
        let stutter_threshold = self
            .frame_period
            .mul_f64(2.2)
            .max(Duration::from_millis(45));
        // Steady-state depth the ring is allowed to sit at; anything beyond
        // this is drift accumulated from the decoder outrunning playback and
        // gets dropped rather than widening latency indefinitely (spec.md
        // §4.3 step 2).
        let target_buffer = (self.ring_capacity / 2).max(1);
        let mut last_drop_log = self.clock.now() - TARGET_BUFFER_DROP_LOG_THROTTLE;

        let mut next_tick = self.clock.now() + self.frame_period;
        let mut last_tick_at = self.clock.now();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            if *self.state.borrow() != RunState::Running {
                self.clock.sleep(Duration::from_millis(20)).await;
                continue;
            }

            let now = self.clock.now();
            if now < next_tick {
                self.clock.sleep(next_tick - now).await;
            }

            let actual_now = self.clock.now();
            let interval = actual_now.saturating_duration_since(last_tick_at);
            if interval > stutter_threshold && self.frames_emitted.load(Ordering::SeqCst) > 0 {
                warn!(?interval, threshold = ?stutter_threshold, kind = ?self.kind, "pacer stutter detected");
                self.stutter_count.fetch_add(1, Ordering::SeqCst);
            }
            self.record_interval(interval);
            last_tick_at = actual_now;

            let mut dropped = 0u32;
            while self.frames.len() > target_buffer {
                if !self.frames.try_drop_oldest() {
                    break;
                }
                dropped += 1;
            }
            if dropped > 0 && actual_now.saturating_duration_since(last_drop_log) >= TARGET_BUFFER_DROP_LOG_THROTTLE {
                warn!(dropped, target_buffer, kind = ?self.kind, "pacer buffer over target; dropped oldest frames");
                last_drop_log = actual_now;
            }

            let behind = actual_now.saturating_duration_since(next_tick);
            let catchup_frames = (behind.as_nanos() / self.frame_period.as_nanos().max(1))
                .min(u128::from(max_catchup)) as u32;
            let frames_this_tick = 1 + catchup_frames;

            for _ in 0..frames_this_tick {
                match self.frames.recv().await {
                    Some(frame) => {
                        write_frame(self.sink.as_ref(), self.kind, &frame.bytes, self.fps).await;
                        self.frames_emitted.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        debug!(kind = ?self.kind, "pacer source exhausted");
                        self.stop();
                        return;
                    }
                }
            }

            next_tick += self.frame_period * frames_this_tick;
        }
    }

    /// Exponential moving average of the inter-tick interval, in
    /// microseconds (spec.md §4.3 `avg_interval`).
    fn record_interval(&self, interval: Duration) {
        let sample = interval.as_micros().min(u128::from(u64::MAX)) as u64;
        let prev = self.avg_interval_us.load(Ordering::SeqCst);
        let next = if prev == 0 { sample } else { (prev * 9 + sample) / 10 };
        self.avg_interval_us.store(next, Ordering::SeqCst);
    }
}

fn to_millis(instant: std::time::Instant) -> u64 {
    // `FrameClock::now()` instants are only ever compared to each other
    // within one pacer's lifetime, so an arbitrary but stable epoch is
    // fine: we use the instant's internal ordering via duration_since on
    // first read, recorded in `started_at_ms`.
    static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(|| instant);
    instant.saturating_duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::media::decoder::DecodedFrame;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct CountingSink {
        count: StdAtomicU64,
    }

    impl MediaSink for CountingSink {
        fn on_pcm_frame(&self, _frame: &[u8]) -> BoxFuture<'_, Result<(), webrtc::Error>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
        fn on_yuv_frame(&self, _frame: &[u8], _fps: u32) -> BoxFuture<'_, Result<(), webrtc::Error>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
        fn frames_sent(&self) -> u64 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn max_catchup_matches_spec_table() {
        assert_eq!(max_catchup(MediaKind::Video, false), 2);
        assert_eq!(max_catchup(MediaKind::Audio, true), 3);
        assert_eq!(max_catchup(MediaKind::Audio, false), 1);
    }

    #[tokio::test]
    async fn pacer_drains_queued_frames_to_sink() {
        let clock = Arc::new(SystemClock);
        let frames = crate::media::decoder::FrameRing::new(4);
        for _ in 0..3 {
            frames.push(DecodedFrame {
                bytes: vec![0u8; crate::media::PCM_BYTES_PER_FRAME],
            });
        }
        frames.close();

        let sink = Arc::new(CountingSink {
            count: StdAtomicU64::new(0),
        });
        let pacer = Arc::new(Pacer::new(
            MediaKind::Audio,
            clock,
            frames,
            sink.clone(),
            4,
            false,
            0,
        ));
        pacer.unpause(None);

        // Give the background task a few ticks to drain the ring.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.frames_sent(), 3);
    }

    #[test]
    fn resync_seeks_frames_emitted_to_audio_position() {
        let clock = Arc::new(SystemClock);
        let frames = crate::media::decoder::FrameRing::new(4);
        let sink = Arc::new(CountingSink {
            count: StdAtomicU64::new(0),
        });
        // Video at 50fps => 20ms frame period; 7000ms of audio lines up
        // with frame index 350.
        let pacer = Pacer::new(MediaKind::Video, clock, frames, sink, 4, false, 50);

        pacer.resync(Some(Duration::from_millis(7000)));
        assert_eq!(pacer.buffer_status().frames_sent, 350);

        pacer.resync(None);
        assert_eq!(pacer.buffer_status().frames_sent, 0);
    }

    #[test]
    fn buffer_status_reports_all_spec_fields() {
        let clock = Arc::new(SystemClock);
        let frames = crate::media::decoder::FrameRing::new(4);
        frames.push(DecodedFrame {
            bytes: vec![0u8; crate::media::PCM_BYTES_PER_FRAME],
        });
        let sink = Arc::new(CountingSink {
            count: StdAtomicU64::new(0),
        });
        let pacer = Pacer::new(MediaKind::Audio, clock, frames, sink, 4, false, 0);

        let status = pacer.buffer_status();
        assert_eq!(status.buffered_frames, 1);
        assert_eq!(status.frames_sent, 0);
        assert_eq!(status.stutter_count, 0);
        assert_eq!(status.target_fps, 100); // 1000ms / 10ms frame period
        assert_eq!(status.avg_interval, Duration::ZERO);
    }

    #[tokio::test]
    async fn run_loop_drops_frames_beyond_target_buffer() {
        let clock = Arc::new(SystemClock);
        // A ring roomy enough to hold all 6 pushed frames without the
        // decoder-side hard-capacity drop kicking in...
        let frames = crate::media::decoder::FrameRing::new(10);
        for _ in 0..6 {
            frames.push(DecodedFrame {
                bytes: vec![0u8; crate::media::PCM_BYTES_PER_FRAME],
            });
        }
        frames.close();

        let sink = Arc::new(CountingSink {
            count: StdAtomicU64::new(0),
        });
        // ...but a pacer configured with ring_capacity 2, so target_buffer
        // is 1: the pacer must drop the other 5 oldest frames itself.
        let pacer = Arc::new(Pacer::new(MediaKind::Audio, clock, frames, sink.clone(), 2, false, 0));
        pacer.unpause(None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            sink.frames_sent(),
            1,
            "only the frames within target_buffer should ever reach the sink"
        );
    }
}
