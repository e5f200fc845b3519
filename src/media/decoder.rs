//! `MediaDecoder` (spec.md §4.2, §6): spawns an external decoder subprocess,
//! reads its raw PCM/YUV stdout into fixed-size frames, and exposes them
//! through a bounded, drop-oldest ring buffer that `Pacer` drains at
//! playback cadence.
//!
//! Grounded on the teacher's `client/src-tauri/src/audio/handle.rs`, which
//! owns a blocking I/O loop inside a dedicated task and exposes start/stop
//! handles to the rest of the app. The subprocess invocation flags and
//! restart policy have no teacher counterpart (the teacher never shells out
//! to a decoder) and are built fresh from spec.md §6.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::config::EffectConfig;
use crate::error::DecoderError;
use crate::media::effects::build_filter_chain;
use crate::media::MediaKind;

/// Where the decoder reads its input from (spec.md §4.2: "a local file or
/// an HTTP(S) stream").
#[derive(Debug, Clone)]
pub enum DecoderSource {
    File(PathBuf),
    Http(String),
}

/// One decode request (spec.md §3 `DecoderJob`).
#[derive(Debug, Clone)]
pub struct DecoderJob {
    pub kind: MediaKind,
    pub source: DecoderSource,
    pub effect: EffectConfig,
    pub video_width: u32,
    pub video_height: u32,
    /// Re-spawn the decoder against the same source on clean EOF
    /// (spec.md §4.2: "looped local playback").
    pub loop_playback: bool,
}

pub(crate) const MAX_RING_FRAMES: usize = 64;
/// Retries *after* the initial attempt (spec.md §8 scenario 4: the error
/// surfaces after the third empty exit overall — one initial pass plus two
/// retries, backoffs 1.2s and 2.4s).
const HTTP_MAX_RETRIES: u32 = 2;
const HTTP_RETRY_BASE_MS: u64 = 1200;
const DROP_LOG_THROTTLE: Duration = Duration::from_millis(1200);
const HTTP_READ_TIMEOUT_US: u64 = 15_000_000;
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// One decoded, fixed-size raw frame.
pub struct DecodedFrame {
    pub bytes: Vec<u8>,
}

/// A bounded frame queue with a true drop-oldest policy (spec.md §4.2:
/// "when the ring buffer is full, the oldest buffered frame is discarded to
/// make room for the newest"). `tokio::sync::mpsc` only supports
/// backpressure or drop-newest, so `Pacer` drains frames through this
/// instead.
pub struct FrameRing {
    queue: Mutex<VecDeque<DecodedFrame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameRing {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Pushes a frame, dropping the oldest buffered one if already at
    /// capacity. Returns `true` if a frame was dropped to make room.
    pub(crate) fn push(&self, frame: DecodedFrame) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_waiters();
        dropped
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Pops the oldest frame, waiting for one to arrive. Returns `None`
    /// once the ring is closed and drained.
    pub async fn recv(&self) -> Option<DecodedFrame> {
        loop {
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the oldest buffered frame without waiting for one to arrive.
    /// Returns `true` if a frame was dropped. Used by `Pacer` to enforce its
    /// own target-buffer drift protection (spec.md §4.3 step 2), separate
    /// from the hard-capacity drop in `push`.
    pub(crate) fn try_drop_oldest(&self) -> bool {
        self.queue.lock().unwrap().pop_front().is_some()
    }
}

/// A running decode job. Dropping this without calling `stop` leaves the
/// subprocess running to completion/EOF; `stop` is for cancelling mid-job
/// (e.g. a user-issued skip).
pub struct DecoderHandle {
    stop_flag: Arc<AtomicBool>,
    finished: Arc<Notify>,
    is_finished: Arc<AtomicBool>,
    pub frames: Arc<FrameRing>,
    pub warnings: mpsc::UnboundedReceiver<String>,
    /// Fires once with the decode loop's terminal result: `Ok(())` for a
    /// clean finish or a user-issued `stop()`, `Err(message)` for an
    /// unrecoverable decode failure (spec.md §7: "an `error` event fires
    /// only on terminal conditions").
    pub outcome: oneshot::Receiver<Result<(), String>>,
}

impl DecoderHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Resolves once the decode loop has exited (clean EOF, unrecoverable
    /// error, or `stop()`) — spec.md §9 decided this crate waits for clean
    /// subprocess shutdown rather than tracking a suppress-next-close latch.
    pub async fn drain(&self) {
        if self.is_finished.load(Ordering::SeqCst) {
            return;
        }
        self.finished.notified().await;
    }
}

/// Starts decoding `job` in a background task, returning a handle whose
/// `frames` channel yields fixed-size raw frames as they arrive.
pub fn start(job: DecoderJob) -> DecoderHandle {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(Notify::new());
    let is_finished = Arc::new(AtomicBool::new(false));
    let frames = FrameRing::new(MAX_RING_FRAMES);
    let (warn_tx, warn_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let task_stop = stop_flag.clone();
    let task_finished = finished.clone();
    let task_is_finished = is_finished.clone();
    let task_frames = frames.clone();

    tokio::spawn(async move {
        let outcome = run_decode_loop(job, &task_stop, &task_frames, &warn_tx).await;
        task_frames.close();
        task_is_finished.store(true, Ordering::SeqCst);
        task_finished.notify_waiters();
        let _ = outcome_tx.send(outcome);
    });

    DecoderHandle {
        stop_flag,
        finished,
        is_finished,
        frames,
        warnings: warn_rx,
        outcome: outcome_rx,
    }
}

async fn run_decode_loop(
    job: DecoderJob,
    stop_flag: &AtomicBool,
    frames: &Arc<FrameRing>,
    warn_tx: &mpsc::UnboundedSender<String>,
) -> Result<(), String> {
    let frame_bytes = job.kind.frame_bytes(job.video_width, job.video_height);
    let fps = if matches!(job.kind, MediaKind::Video) {
        probe_fps(&job.source).await
    } else {
        0
    };

    let mut http_attempt = 0u32;

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        match run_one_pass(&job, frame_bytes, stop_flag, frames, warn_tx, fps).await {
            Ok(PassOutcome::CleanEof) => {
                http_attempt = 0;
                if job.loop_playback && matches!(job.source, DecoderSource::File(_)) {
                    continue;
                }
                return Ok(());
            }
            Ok(PassOutcome::Stopped) => return Ok(()),
            Err(err) => {
                let _ = warn_tx.send(err.to_string());
                warn!(error = %err, "decoder pass failed");

                if let DecoderSource::Http(_) = job.source {
                    http_attempt += 1;
                    if http_attempt > HTTP_MAX_RETRIES {
                        let message = format!("decoder giving up after {HTTP_MAX_RETRIES} HTTP retries");
                        let _ = warn_tx.send(message.clone());
                        return Err(message);
                    }
                    let backoff = Duration::from_millis(HTTP_RETRY_BASE_MS * u64::from(http_attempt));
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                return Err(err.to_string());
            }
        }
    }
}

enum PassOutcome {
    CleanEof,
    Stopped,
}

async fn run_one_pass(
    job: &DecoderJob,
    frame_bytes: usize,
    stop_flag: &AtomicBool,
    frames: &FrameRing,
    warn_tx: &mpsc::UnboundedSender<String>,
    fps: u32,
) -> Result<PassOutcome, DecoderError> {
    if let DecoderSource::File(path) = &job.source {
        if !path.exists() {
            return Err(DecoderError::FileMissing(path.display().to_string()));
        }
    }

    let mut command = build_command(job, fps);
    let mut child = command
        .spawn()
        .map_err(|e| DecoderError::SpawnFailed(e.to_string()))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let stderr_tail = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = tokio::io::AsyncReadExt::read_to_string(&mut stderr, &mut buf).await;
        buf
    });

    let mut buf = vec![0u8; frame_bytes];
    let mut total_frames = 0u64;
    let mut last_drop_log = tokio::time::Instant::now() - DROP_LOG_THROTTLE;

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            let _ = child.start_kill();
            return Ok(PassOutcome::Stopped);
        }

        match stdout.read_exact(&mut buf).await {
            Ok(_) => {
                total_frames += 1;
                let dropped = frames.push(DecodedFrame { bytes: buf.clone() });
                if dropped && last_drop_log.elapsed() >= DROP_LOG_THROTTLE {
                    warn!("decoder ring buffer full; dropped oldest frame");
                    last_drop_log = tokio::time::Instant::now();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                let _ = child.start_kill();
                return Err(DecoderError::Io(e));
            }
        }
    }

    let status = child.wait().await.map_err(DecoderError::Io)?;
    let stderr_text = stderr_tail.await.unwrap_or_default();

    if total_frames == 0 {
        let last_line = stderr_text.lines().last().unwrap_or("").to_string();
        return Err(DecoderError::ExitedEmpty {
            last_stderr: last_line,
        });
    }

    if !status.success() {
        debug!(code = ?status.code(), "decoder exited non-zero after producing frames");
    }

    Ok(PassOutcome::CleanEof)
}

fn build_command(job: &DecoderJob, fps: u32) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .args(["-fflags", "nobuffer", "-flags", "low_delay"]);

    if let DecoderSource::Http(_) = job.source {
        cmd.args([
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "2",
            "-rw_timeout",
            &HTTP_READ_TIMEOUT_US.to_string(),
            "-user_agent",
            BROWSER_USER_AGENT,
        ]);
    }

    let input = match &job.source {
        DecoderSource::File(path) => path.display().to_string(),
        DecoderSource::Http(url) => url.clone(),
    };
    cmd.args(["-i", &input]);

    match job.kind {
        MediaKind::Audio => {
            cmd.args(["-vn"]);
            if let Some(chain) = build_filter_chain(&job.effect) {
                cmd.args(["-af", &chain]);
            }
            cmd.args(["-f", "s16le", "-ar", "48000", "-ac", "1", "pipe:1"]);
        }
        MediaKind::Video => {
            let fps = if fps == 0 { 30 } else { fps };
            cmd.args(["-an"]);
            let scale = format!(
                "scale={}:{}:force_original_aspect_ratio=decrease,pad={}:{}:(ow-iw)/2:(oh-ih)/2,fps={}",
                job.video_width, job.video_height, job.video_width, job.video_height, fps
            );
            cmd.args([
                "-vf", &scale, "-c:v", "rawvideo", "-pix_fmt", "yuv420p", "-f", "rawvideo", "pipe:1",
            ]);
        }
    }

    cmd
}

/// Probes the source's frame rate via `ffprobe`, overriding the default 30
/// fps only when the detected value is sane — `(1, 240)` per spec.md §6.
async fn probe_fps(source: &DecoderSource) -> u32 {
    let input = match source {
        DecoderSource::File(path) => path.display().to_string(),
        DecoderSource::Http(url) => url.clone(),
    };

    let output = Command::new("ffprobe")
        .args([
            "-v", "error", "-select_streams", "v:0", "-show_entries", "stream=r_frame_rate", "-of", "csv=p=0",
        ])
        .arg(&input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let Ok(output) = output else { return 0 };
    let text = String::from_utf8_lossy(&output.stdout);
    let detected = parse_frame_rate(text.trim());

    match detected {
        Some(fps) if fps > 1 && fps < 240 => fps,
        _ => 0,
    }
}

fn parse_frame_rate(text: &str) -> Option<u32> {
    if let Some((num, den)) = text.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some((num / den).round() as u32)
    } else {
        text.parse::<f64>().ok().map(|v| v.round() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_rate_handles_fraction_and_plain() {
        assert_eq!(parse_frame_rate("30000/1001"), Some(30));
        assert_eq!(parse_frame_rate("25"), Some(25));
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[tokio::test]
    async fn missing_file_reports_file_missing_error() {
        let job = DecoderJob {
            kind: MediaKind::Audio,
            source: DecoderSource::File(PathBuf::from("/nonexistent/clip.mp3")),
            effect: EffectConfig::default(),
            video_width: 640,
            video_height: 360,
            loop_playback: false,
        };
        let stop_flag = AtomicBool::new(false);
        let frames = FrameRing::new(4);
        let (warn_tx, _warn_rx) = mpsc::unbounded_channel();
        let result = run_one_pass(&job, job.kind.frame_bytes(640, 360), &stop_flag, &frames, &warn_tx, 0).await;
        assert!(matches!(result, Err(DecoderError::FileMissing(_))));
    }

    #[tokio::test]
    async fn start_reports_terminal_failure_through_outcome() {
        let job = DecoderJob {
            kind: MediaKind::Audio,
            source: DecoderSource::File(PathBuf::from("/nonexistent/clip.mp3")),
            effect: EffectConfig::default(),
            video_width: 640,
            video_height: 360,
            loop_playback: false,
        };
        let handle = start(job);
        let outcome = handle.outcome.await.expect("decode task did not panic");
        assert!(outcome.is_err(), "missing file should surface as a terminal error");
    }

    #[tokio::test]
    async fn http_source_gives_up_after_exactly_three_passes() {
        let job = DecoderJob {
            kind: MediaKind::Audio,
            source: DecoderSource::Http("http://127.0.0.1:1/unreachable.mp3".to_string()),
            effect: EffectConfig::default(),
            video_width: 640,
            video_height: 360,
            loop_playback: false,
        };
        let stop_flag = AtomicBool::new(false);
        let frames = FrameRing::new(4);
        let (warn_tx, mut warn_rx) = mpsc::unbounded_channel();

        let result = run_decode_loop(job, &stop_flag, &frames, &warn_tx).await;
        assert!(result.is_err());

        // One warning per failed pass, plus the final "giving up" message.
        // Scenario 4: one initial attempt plus two retries, not four passes.
        let mut pass_failures = 0;
        while let Ok(msg) = warn_rx.try_recv() {
            if !msg.contains("giving up") {
                pass_failures += 1;
            }
        }
        assert_eq!(pass_failures, 3);
    }
}
