//! `VoiceConnection` (spec.md §3, §4.5): the top-level orchestrator that owns
//! the peer map, the admission queue, and the audio/video media pipelines,
//! and mediates every cross-peer effect (video track binding, force
//! reconnect, resync) so `PeerSession` never reaches into a sibling.
//!
//! Grounded on the teacher's `server/src/voice/sfu.rs::SfuServer` (top-level
//! owner-of-rooms-and-`API` shape) merged with `client/src-tauri/src/
//! commands/voice.rs`'s `join_voice`/`leave_voice` lifecycle, since spec.md's
//! `VoiceConnection` is simultaneously the server-side SFU's per-room owner
//! and the client's per-call orchestrator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::clock::FrameClock;
use crate::config::{select_tier, EffectConfig, TierRow, VoiceChannelIdentity, VoiceConnectionConfig};
use crate::error::VoiceError;
use crate::media::decoder::{self, DecoderJob, DecoderSource, FrameRing};
use crate::media::pacer::Pacer;
use crate::media::sink::{MediaSink, TrackSink};
use crate::media::MediaKind;
use crate::rtc::{PeerConnectionFactory, TrackHandle, TrackKind};
use crate::signalling::{InboundSignal, OutboundSignal, SignallingTransport};
use crate::voice::admission::{jitter, mass_join_batches, participant_stagger, single_joiner_stagger, AdmissionQueue};
use crate::voice::peer::{PeerSession, SessionEvent};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(3);
const MASS_JOIN_BATCH_GAP: Duration = Duration::from_secs(5);
const MASS_JOIN_COOLDOWN: Duration = Duration::from_secs(10);
const RECONNECT_STAGGER_MAX: Duration = Duration::from_secs(2);
const AUDIO_SOLO_FALLBACK: Duration = Duration::from_secs(3);
const AV_BARRIER_FALLBACK: Duration = Duration::from_millis(2500);
const AV_REJOIN_BARRIER: Duration = Duration::from_millis(120);
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Which capture surface a video playback came from (spec.md §4.4
/// `play_video`'s `type ∈ {screen, camera}`). Affects only the outbound
/// track's stream label — the decode/pace path is identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSourceKind {
    Screen,
    Camera,
}

impl VideoSourceKind {
    fn stream_id(self) -> &'static str {
        match self {
            VideoSourceKind::Screen => "voxmesh-screen",
            VideoSourceKind::Camera => "voxmesh-camera",
        }
    }
}

/// Terminal playback outcome delivered once per `play_file`/`play_url`/
/// `play_video` call (spec.md §7: "A `finish` event fires when the decoder
/// exits cleanly AND the Pacer's buffer drains. An `error` event fires only
/// on terminal conditions").
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    Finished { kind: MediaKind },
    Error { kind: MediaKind, message: String },
}

/// Splits a combined path-or-URL argument the way `play_video` accepts it
/// (spec.md §4.4), mirroring the `play_file`/`play_url` split.
fn decoder_source_from_str(source: impl Into<String>) -> DecoderSource {
    let source = source.into();
    if source.starts_with("http://") || source.starts_with("https://") {
        DecoderSource::Http(source)
    } else {
        DecoderSource::File(PathBuf::from(source))
    }
}

struct MediaPipeline<C: FrameClock> {
    decoder_stop: Arc<AtomicBool>,
    pacer: Arc<Pacer<C>>,
}

/// The bot's outbound audio: built once and held for the connection's
/// lifetime (spec.md §3 "the audio source exists for the connection's
/// lifetime"); only the decode/pace pipeline behind it comes and goes.
struct AudioState<C: FrameClock> {
    track: Arc<TrackLocalStaticSample>,
    sink: Arc<TrackSink>,
    pipeline: tokio::sync::Mutex<Option<MediaPipeline<C>>>,
}

/// The bot's outbound video, built lazily on the first `play_video` call and
/// torn down entirely by `stop_video` (spec.md §3 "the video source exists
/// only while play_video is active").
struct VideoState<C: FrameClock> {
    track: Arc<TrackLocalStaticSample>,
    sink: Arc<TrackSink>,
    /// Set once this track has been handed to at least one peer, so a
    /// subsequent `play_video` rebuild knows to `replace_track` rather than
    /// `add_track` on already-connected peers (spec.md §8's round-trip law).
    ever_bound: AtomicBool,
    pipeline: tokio::sync::Mutex<Option<MediaPipeline<C>>>,
}

fn build_audio_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 1,
            ..Default::default()
        },
        "audio".to_string(),
        "voxmesh".to_string(),
    ))
}

fn build_video_track(kind: VideoSourceKind) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
        "video".to_string(),
        kind.stream_id().to_string(),
    ))
}

/// Polls `frames` until it has at least one buffered frame or `timeout`
/// elapses, whichever is first (spec.md §8 scenario 1's "decoder produces a
/// frame or 3s elapses, whichever is first").
async fn wait_for_frame_or_timeout<C: FrameClock>(clock: &C, frames: &FrameRing, timeout: Duration) {
    let deadline = clock.now() + timeout;
    loop {
        if !frames.is_empty() || clock.now() >= deadline {
            return;
        }
        clock.sleep(FRAME_POLL_INTERVAL).await;
    }
}

/// Per-channel orchestrator (spec.md §3 `VoiceConnection`). Generic over the
/// same `F`/`C` type parameters as `PeerSession` so the whole mesh can be
/// driven deterministically in tests.
pub struct VoiceConnection<F: PeerConnectionFactory, C: FrameClock> {
    identity: VoiceChannelIdentity,
    config: VoiceConnectionConfig,
    factory: Arc<F>,
    clock: Arc<C>,
    signalling: Arc<dyn SignallingTransport>,

    peers: DashMap<String, Arc<PeerSession<F::Connection, C>>>,
    priority_peers: DashSet<String>,
    admission: AdmissionQueue,
    joined: AtomicBool,
    mass_join_active: AtomicBool,

    audio: AudioState<C>,
    video: tokio::sync::Mutex<Option<VideoState<C>>>,
    last_video_state_sent: tokio::sync::Mutex<Option<bool>>,

    session_events_tx: mpsc::UnboundedSender<SessionEvent>,
    session_events_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,

    playback_events_tx: mpsc::UnboundedSender<PlaybackEvent>,
    playback_events_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<PlaybackEvent>>>,
}

impl<F: PeerConnectionFactory, C: FrameClock> VoiceConnection<F, C> {
    pub fn new(
        identity: VoiceChannelIdentity,
        config: VoiceConnectionConfig,
        factory: Arc<F>,
        clock: Arc<C>,
        signalling: Arc<dyn SignallingTransport>,
    ) -> Arc<Self> {
        let audio_track = build_audio_track();
        let audio = AudioState {
            sink: Arc::new(TrackSink::new(audio_track.clone())),
            track: audio_track,
            pipeline: tokio::sync::Mutex::new(None),
        };
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        let (playback_events_tx, playback_events_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            identity,
            config,
            factory,
            clock,
            signalling,
            peers: DashMap::new(),
            priority_peers: DashSet::new(),
            admission: AdmissionQueue::new(),
            joined: AtomicBool::new(false),
            mass_join_active: AtomicBool::new(false),
            audio,
            video: tokio::sync::Mutex::new(None),
            last_video_state_sent: tokio::sync::Mutex::new(None),
            session_events_tx,
            session_events_rx: tokio::sync::Mutex::new(Some(session_events_rx)),
            playback_events_tx,
            playback_events_rx: tokio::sync::Mutex::new(Some(playback_events_rx)),
        })
    }

    /// Takes ownership of the playback `finish`/`error` event stream
    /// (spec.md §7). May only be called once; panics on a second call, the
    /// same one-shot-receiver contract `join()` uses for session events.
    pub async fn take_playback_events(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        self.playback_events_rx
            .lock()
            .await
            .take()
            .expect("playback events receiver already taken")
    }

    pub fn channel_id(&self) -> &str {
        &self.identity.channel_id
    }

    pub fn server_id(&self) -> &str {
        &self.identity.server_id
    }

    pub fn connected(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_mass_join_active(&self) -> bool {
        self.mass_join_active.load(Ordering::SeqCst)
    }

    /// Priority peers bypass the `max_connected_peers` capacity gate
    /// (spec.md §4.5 admission gate 1).
    pub fn set_peer_priority(&self, peer_id: &str, is_priority: bool) {
        if is_priority {
            self.priority_peers.insert(peer_id.to_string());
        } else {
            self.priority_peers.remove(peer_id);
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub async fn join(self: &Arc<Self>) -> Result<(), VoiceError> {
        if self.joined.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inbound_rx = self.signalling.take_inbound();
        tokio::spawn(self.clone().inbound_loop(inbound_rx));

        let session_rx = self
            .session_events_rx
            .lock()
            .await
            .take()
            .expect("session events receiver already taken");
        tokio::spawn(self.clone().session_event_loop(session_rx));

        tokio::spawn(self.clone().pump_loop());
        tokio::spawn(self.clone().heartbeat_loop());

        self.signalling
            .send(OutboundSignal::Join {
                channel_id: self.identity.channel_id.clone(),
                server_id: self.identity.server_id.clone(),
                peer_id: self.identity.local_peer_id.clone(),
            })
            .await
            .map_err(VoiceError::from)
    }

    pub async fn leave(self: &Arc<Self>) -> Result<(), VoiceError> {
        if !self.joined.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_audio().await;
        self.stop_video().await;

        let peer_ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
        self.admission.clear();
        self.priority_peers.clear();

        self.signalling
            .send(OutboundSignal::Leave {
                channel_id: self.identity.channel_id.clone(),
            })
            .await
            .map_err(VoiceError::from)
    }

    /// Called by a concrete gateway wrapper once its own reconnect-with-
    /// backoff loop succeeds (spec.md §4.5 "Signalling reconnect"). Not part
    /// of `SignallingTransport` itself — that trait's capability set stays
    /// narrow per spec.md §9, so the notification lives on the orchestrator
    /// instead.
    pub async fn handle_transport_reconnected(self: &Arc<Self>) {
        if !self.joined.load(Ordering::SeqCst) {
            return;
        }

        let peer_ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer_id in &peer_ids {
            self.remove_peer(peer_id).await;
        }

        let _ = self
            .signalling
            .send(OutboundSignal::Join {
                channel_id: self.identity.channel_id.clone(),
                server_id: self.identity.server_id.clone(),
                peer_id: self.identity.local_peer_id.clone(),
            })
            .await;
        let _ = self
            .signalling
            .send(OutboundSignal::Heartbeat {
                channel_id: self.identity.channel_id.clone(),
            })
            .await;

        let n = peer_ids.len().max(1) as u64;
        let per_peer = (RECONNECT_STAGGER_MAX.as_millis() as u64 / n).max(1);
        for (i, peer_id) in peer_ids.into_iter().enumerate() {
            self.spawn_staggered_enqueue(peer_id, Duration::from_millis(per_peer * i as u64));
        }

        if self.video.lock().await.is_some() {
            self.announce_video_state(true).await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            if !self.joined.load(Ordering::SeqCst) {
                self.clock.sleep(Duration::from_millis(200)).await;
                continue;
            }
            self.clock
                .sleep(Duration::from_millis(self.config.heartbeat_interval_ms))
                .await;
            if !self.joined.load(Ordering::SeqCst) {
                continue;
            }
            let result = self
                .signalling
                .send(OutboundSignal::Heartbeat {
                    channel_id: self.identity.channel_id.clone(),
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "failed to send heartbeat");
            }
        }
    }

    // ---- admission ------------------------------------------------------

    async fn pump_loop(self: Arc<Self>) {
        loop {
            if !self.joined.load(Ordering::SeqCst) {
                self.clock.sleep(Duration::from_millis(100)).await;
                continue;
            }

            let tier = select_tier(self.peers.len() + self.admission.len());
            if self.admission.active_negotiations() >= tier.concurrent {
                self.clock.sleep(Duration::from_millis(50)).await;
                continue;
            }

            let Some(peer_id) = self.admission.dequeue() else {
                self.clock.sleep(Duration::from_millis(50)).await;
                continue;
            };

            let now = self.clock.now();
            if !self.admission_gates_pass(&peer_id, now, &tier) {
                debug!(peer = %peer_id, "admission gate rejected queued peer");
                continue;
            }

            self.admission.begin_negotiation();
            self.admission.record_attempt(&peer_id, now);

            if let Err(err) = self.admit_peer(&peer_id).await {
                if !err.is_silent() {
                    warn!(peer = %peer_id, error = %err, "failed to admit peer");
                }
                self.admission.end_negotiation();
                continue;
            }

            let this = self.clone();
            let settle_peer = peer_id.clone();
            tokio::spawn(async move {
                this.clock.sleep(NEGOTIATION_TIMEOUT).await;
                this.admission.end_negotiation();
                debug!(peer = %settle_peer, "negotiation slot released");
            });

            self.clock.sleep(Duration::from_millis(tier.stagger_per_peer_ms)).await;
        }
    }

    fn admission_gates_pass(&self, peer_id: &str, now: Instant, tier: &TierRow) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        let priority = self.priority_peers.contains(peer_id);
        if !priority && self.peers.len() >= self.config.max_connected_peers {
            return false;
        }
        self.admission
            .cooldown_ready(peer_id, now, Duration::from_millis(tier.cooldown_ms))
    }

    /// Builds a connection, wires its session, and attaches the persistent
    /// audio track — attaching the track is what triggers `negotiation_needed`
    /// and starts the offer/answer dance (spec.md §4.5 admission pump step 2).
    async fn admit_peer(self: &Arc<Self>, peer_id: &str) -> Result<(), VoiceError> {
        let pc = self
            .factory
            .build()
            .await
            .map_err(|e| VoiceError::PeerConnectionBuild {
                peer: peer_id.to_string(),
                source: e,
            })?;

        let session = PeerSession::new(
            self.identity.local_peer_id.clone(),
            peer_id.to_string(),
            self.identity.channel_id.clone(),
            pc,
            self.clock.clone(),
            self.signalling.clone(),
            self.session_events_tx.clone(),
        );
        session.spawn_event_loop();
        session.add_initial_track(TrackKind::Audio, self.audio.track.clone()).await?;
        self.peers.insert(peer_id.to_string(), session);
        Ok(())
    }

    /// Looks up an existing session, or admits one directly outside the
    /// queue (spec.md §3: "a `PeerSession` is created on admission or on
    /// first inbound signal") — still subject to the capacity gate.
    async fn get_or_create_session_for_inbound(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> Result<Arc<PeerSession<F::Connection, C>>, VoiceError> {
        if let Some(existing) = self.peers.get(peer_id) {
            return Ok(existing.value().clone());
        }

        let priority = self.priority_peers.contains(peer_id);
        if !priority && self.peers.len() >= self.config.max_connected_peers {
            return Err(VoiceError::CapacityExceeded {
                peer: peer_id.to_string(),
            });
        }

        self.admission.begin_negotiation();
        let result = self.admit_peer(peer_id).await;
        self.admission.end_negotiation();
        result?;

        Ok(self
            .peers
            .get(peer_id)
            .expect("just admitted")
            .value()
            .clone())
    }

    async fn remove_peer(&self, peer_id: &str) {
        if let Some((_, session)) = self.peers.remove(peer_id) {
            session.close().await;
        }
    }

    fn spawn_staggered_enqueue(self: &Arc<Self>, peer_id: String, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            this.clock.sleep(delay).await;
            this.admission.enqueue(peer_id);
        });
    }

    // ---- inbound signalling ----------------------------------------------

    async fn inbound_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<InboundSignal>) {
        while let Some(event) = rx.recv().await {
            if event.channel_id() != self.identity.channel_id {
                continue;
            }
            if let Err(err) = self.handle_inbound(event).await {
                if !err.is_silent() {
                    warn!(error = %err, "inbound signal handling failed");
                }
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundSignal) -> Result<(), VoiceError> {
        match event {
            InboundSignal::Participants { participants, .. } => {
                self.dispatch_participant_list(participants);
            }
            InboundSignal::UserJoined { peer, .. } => {
                self.dispatch_single_joiner(peer.id);
            }
            InboundSignal::UserLeft { peer, .. } => {
                self.remove_peer(&peer.id).await;
            }
            InboundSignal::Offer { from, offer, .. } => {
                let session = self.get_or_create_session_for_inbound(&from).await?;
                session.handle_offer(offer).await?;
            }
            InboundSignal::Answer { from, answer, .. } => {
                if let Some(session) = self.peers.get(&from).map(|e| e.value().clone()) {
                    session.handle_answer(answer).await?;
                }
            }
            InboundSignal::IceCandidate { from, candidate, .. } => {
                if let Some(session) = self.peers.get(&from).map(|e| e.value().clone()) {
                    session.handle_candidate(candidate).await?;
                }
            }
            InboundSignal::ForceReconnect { target_peer, reason, .. } => {
                self.handle_force_reconnect(&target_peer, &reason).await;
            }
            InboundSignal::ResyncRequest { from, .. } => {
                self.handle_resync_request(&from).await;
            }
        }
        Ok(())
    }

    /// Staggers each candidate into the admission queue (spec.md §4.5
    /// "participant-list dispatch"), switching to batched mass-join dispatch
    /// once the crowd exceeds the selected tier's batch cap
    /// (`min(tier.max_peers, 20)` — spec.md §4.5's literal "N > tier.max_peers"
    /// is unreachable by construction since `select_tier` only ever returns a
    /// tier whose `max_peers` already covers N; its own §8 worked examples
    /// for N=60 and N=100 both batch well before N reaches `tier.max_peers`,
    /// so the batch cap is the threshold that actually matches them).
    fn dispatch_participant_list(self: &Arc<Self>, participants: Vec<String>) {
        let candidates: Vec<String> = participants
            .into_iter()
            .filter(|p| *p != self.identity.local_peer_id && !self.peers.contains_key(p))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let tier = select_tier(self.peers.len() + candidates.len());
        let batch_size = tier.max_peers.min(20).max(1);
        if candidates.len() <= batch_size {
            for (i, peer_id) in candidates.into_iter().enumerate() {
                let delay = participant_stagger(&tier, i) + jitter(200);
                self.spawn_staggered_enqueue(peer_id, delay);
            }
            return;
        }

        self.mass_join_active.store(true, Ordering::SeqCst);
        let batches = mass_join_batches(&candidates, &tier);
        let num_batches = batches.len();
        let last_batch_len = batches.last().map_or(0, Vec::len);

        for (batch_idx, batch) in batches.into_iter().enumerate() {
            let batch_offset = MASS_JOIN_BATCH_GAP * batch_idx as u32;
            for (i, peer_id) in batch.into_iter().enumerate() {
                let delay = batch_offset + participant_stagger(&tier, i) + jitter(200);
                self.spawn_staggered_enqueue(peer_id, delay);
            }
        }

        let settle = MASS_JOIN_BATCH_GAP * num_batches.saturating_sub(1) as u32
            + participant_stagger(&tier, last_batch_len.saturating_sub(1))
            + MASS_JOIN_COOLDOWN;
        let this = self.clone();
        tokio::spawn(async move {
            this.clock.sleep(settle).await;
            this.mass_join_active.store(false, Ordering::SeqCst);
        });
    }

    /// Schedules a single `user-joined` arrival (spec.md §4.5 "Single
    /// joiner": delay grows gently with crowd size).
    fn dispatch_single_joiner(self: &Arc<Self>, peer_id: String) {
        if peer_id == self.identity.local_peer_id || self.peers.contains_key(&peer_id) {
            return;
        }
        let tier = select_tier(self.peers.len() + 1);
        let delay = single_joiner_stagger(&tier, self.peers.len()) + jitter(300);
        self.spawn_staggered_enqueue(peer_id, delay);
    }

    /// spec.md §4.5 "Force reconnect": a self-targeted or peer-targeted
    /// request tears down and re-queues; a broadcast (`"*"`/`"all"`) is
    /// deliberately ignored — a resilient bot does not self-reconnect on a
    /// broadcast meant for every participant.
    async fn handle_force_reconnect(self: &Arc<Self>, target: &str, reason: &str) {
        if target == "*" || target.eq_ignore_ascii_case("all") {
            debug!(reason, "ignoring broadcast force-reconnect");
            return;
        }

        if target == self.identity.local_peer_id {
            let peer_ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
            for peer_id in peer_ids {
                self.remove_peer(&peer_id).await;
                self.admission.enqueue(peer_id.clone());
            }
        } else {
            self.remove_peer(target).await;
            self.admission.enqueue(target.to_string());
        }
    }

    /// spec.md §4.5 "Resync request": resync the video pacer against the
    /// current audio position and force an ICE restart toward the requester.
    async fn handle_resync_request(self: &Arc<Self>, from: &str) {
        let audio_position = {
            let guard = self.audio.pipeline.lock().await;
            guard.as_ref().map(|p| p.pacer.position().elapsed)
        };

        {
            let video_guard = self.video.lock().await;
            if let Some(video) = video_guard.as_ref() {
                if let Some(pipeline) = video.pipeline.lock().await.as_ref() {
                    pipeline.pacer.resync(audio_position);
                }
            }
        }

        if let Some(session) = self.peers.get(from).map(|e| e.value().clone()) {
            session.ice_restart().await;
        }
    }

    // ---- session events ---------------------------------------------------

    async fn session_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Connected { remote_id } => self.on_peer_connected(&remote_id).await,
                SessionEvent::Closed { remote_id } => self.remove_peer(&remote_id).await,
            }
        }
    }

    /// Binds the active video track (if any) to a freshly connected peer,
    /// and — if both audio and video are already playing — barriers the
    /// newcomer onto the running pair (spec.md §8 scenario 6).
    async fn on_peer_connected(self: &Arc<Self>, remote_id: &str) {
        let Some(session) = self.peers.get(remote_id).map(|e| e.value().clone()) else {
            return;
        };

        let video_guard = self.video.lock().await;
        let Some(video) = video_guard.as_ref() else {
            return;
        };

        let th: TrackHandle = video.track.clone();
        if let Err(err) = session.bind_video_track(th, false).await {
            warn!(peer = remote_id, error = %err, "failed to bind video track for newly connected peer");
            return;
        }

        let video_pipeline_guard = video.pipeline.lock().await;
        let Some(video_pipeline) = video_pipeline_guard.as_ref() else {
            return;
        };
        let audio_pipeline_guard = self.audio.pipeline.lock().await;
        let Some(audio_pipeline) = audio_pipeline_guard.as_ref() else {
            return;
        };

        let audio_position = audio_pipeline.pacer.position().elapsed;
        audio_pipeline.pacer.pause();
        video_pipeline.pacer.pause();
        video_pipeline.pacer.resync(Some(audio_position));
        let barrier = self.clock.now() + AV_REJOIN_BARRIER;
        audio_pipeline.pacer.unpause(Some(barrier));
        video_pipeline.pacer.unpause(Some(barrier));
    }

    /// Watches a decoder's terminal outcome and the pacer's buffer draining
    /// empty, then emits the matching `PlaybackEvent` exactly once (spec.md
    /// §7: "finish" only after both the decoder exits cleanly and the
    /// buffer drains; "error" only on a terminal decode failure).
    fn spawn_playback_monitor(self: &Arc<Self>, kind: MediaKind, handle: decoder::DecoderHandle, pacer: Arc<Pacer<C>>) {
        let this = self.clone();
        tokio::spawn(async move {
            let decoder::DecoderHandle { outcome, .. } = handle;
            let result = outcome.await;

            while pacer.buffer_status().buffered_frames > 0 {
                this.clock.sleep(FRAME_POLL_INTERVAL).await;
            }

            let event = match result {
                Ok(Ok(())) => PlaybackEvent::Finished { kind },
                Ok(Err(message)) => PlaybackEvent::Error { kind, message },
                Err(_) => PlaybackEvent::Finished { kind },
            };
            let _ = this.playback_events_tx.send(event);
        });
    }

    // ---- media: audio -------------------------------------------------

    pub async fn play_file(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        effect: EffectConfig,
        loop_playback: bool,
    ) -> Result<(), VoiceError> {
        self.start_audio(DecoderSource::File(path.into()), effect, loop_playback).await
    }

    pub async fn play_url(self: &Arc<Self>, url: impl Into<String>, effect: EffectConfig) -> Result<(), VoiceError> {
        self.start_audio(DecoderSource::Http(url.into()), effect, false).await
    }

    async fn start_audio(
        self: &Arc<Self>,
        source: DecoderSource,
        effect: EffectConfig,
        loop_playback: bool,
    ) -> Result<(), VoiceError> {
        self.stop_audio().await;

        let is_http = matches!(source, DecoderSource::Http(_));
        let job = DecoderJob {
            kind: MediaKind::Audio,
            source,
            effect,
            video_width: self.config.video_width,
            video_height: self.config.video_height,
            loop_playback,
        };
        let handle = decoder::start(job);
        let frames = handle.frames.clone();
        let decoder_stop = handle.stop_flag();
        let pacer = Arc::new(Pacer::new(
            MediaKind::Audio,
            self.clock.clone(),
            frames.clone(),
            self.audio.sink.clone(),
            decoder::MAX_RING_FRAMES,
            is_http,
            0,
        ));
        pacer.prime();

        {
            let mut guard = self.audio.pipeline.lock().await;
            *guard = Some(MediaPipeline {
                decoder_stop,
                pacer: pacer.clone(),
            });
        }
        self.spawn_playback_monitor(MediaKind::Audio, handle, pacer.clone());

        // spec.md §8 scenario 1: unpause as soon as the decoder produces a
        // frame, or after a 3s fallback if it never does.
        let this = self.clone();
        tokio::spawn(async move {
            wait_for_frame_or_timeout(this.clock.as_ref(), &frames, AUDIO_SOLO_FALLBACK).await;
            let still_current = this
                .audio
                .pipeline
                .lock()
                .await
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(&p.pacer, &pacer));
            if still_current {
                pacer.unpause(None);
            }
        });

        Ok(())
    }

    /// Stops the active audio pipeline, if any. Idempotent (spec.md §8's
    /// round-trip law).
    pub async fn stop_audio(&self) {
        let mut guard = self.audio.pipeline.lock().await;
        if let Some(pipeline) = guard.take() {
            pipeline.pacer.stop();
            pipeline.decoder_stop.store(true, Ordering::SeqCst);
        }
    }

    // ---- media: video ---------------------------------------------------

    /// `source` is a local path or an `http(s)://` URL, distinguished the
    /// same way `play_file`/`play_url` are (spec.md §4.4 `play_video(
    /// path_or_url, { loop?, type })`).
    pub async fn play_video(
        self: &Arc<Self>,
        source: impl Into<String>,
        kind: VideoSourceKind,
        effect: EffectConfig,
        loop_playback: bool,
    ) -> Result<(), VoiceError> {
        self.start_video(decoder_source_from_str(source), kind, effect, loop_playback).await
    }

    async fn start_video(
        self: &Arc<Self>,
        source: DecoderSource,
        kind: VideoSourceKind,
        effect: EffectConfig,
        loop_playback: bool,
    ) -> Result<(), VoiceError> {
        let track = build_video_track(kind);
        let sink = Arc::new(TrackSink::new(track.clone()));

        let rebinds_existing_peers = {
            let mut guard = self.video.lock().await;
            let was_bound = match guard.take() {
                Some(old) => {
                    if let Some(pipeline) = old.pipeline.lock().await.take() {
                        pipeline.pacer.stop();
                        pipeline.decoder_stop.store(true, Ordering::SeqCst);
                    }
                    old.ever_bound.load(Ordering::SeqCst)
                }
                None => false,
            };
            *guard = Some(VideoState {
                track: track.clone(),
                sink: sink.clone(),
                ever_bound: AtomicBool::new(false),
                pipeline: tokio::sync::Mutex::new(None),
            });
            was_bound
        };

        if rebinds_existing_peers {
            let th: TrackHandle = track.clone();
            for entry in self.peers.iter() {
                let session = entry.value().clone();
                if session.is_connected() {
                    if let Err(err) = session.bind_video_track(th.clone(), true).await {
                        warn!(peer = %session.remote_id, error = %err, "failed to rebind video track");
                    }
                }
            }
            if let Some(video) = self.video.lock().await.as_ref() {
                video.ever_bound.store(true, Ordering::SeqCst);
            }
        }

        let job = DecoderJob {
            kind: MediaKind::Video,
            source,
            effect,
            video_width: self.config.video_width,
            video_height: self.config.video_height,
            loop_playback,
        };
        let handle = decoder::start(job);
        let frames = handle.frames.clone();
        let decoder_stop = handle.stop_flag();
        let pacer = Arc::new(Pacer::new(
            MediaKind::Video,
            self.clock.clone(),
            frames.clone(),
            sink,
            decoder::MAX_RING_FRAMES,
            false,
            0,
        ));
        pacer.prime();

        if let Some(video) = self.video.lock().await.as_ref() {
            *video.pipeline.lock().await = Some(MediaPipeline {
                decoder_stop,
                pacer: pacer.clone(),
            });
        }
        self.spawn_playback_monitor(MediaKind::Video, handle, pacer.clone());

        self.start_av_barrier(frames, pacer);
        self.announce_video_state(true).await;
        Ok(())
    }

    /// Starts video playback, barriering it against any already-running
    /// audio pacer (spec.md §8 scenario 6's resync/barrier mechanics, applied
    /// here to starting video while audio already plays).
    fn start_av_barrier(self: &Arc<Self>, video_frames: Arc<FrameRing>, video_pacer: Arc<Pacer<C>>) {
        let this = self.clone();
        tokio::spawn(async move {
            wait_for_frame_or_timeout(this.clock.as_ref(), &video_frames, AV_BARRIER_FALLBACK).await;

            let audio_guard = this.audio.pipeline.lock().await;
            let Some(audio_pipeline) = audio_guard.as_ref() else {
                drop(audio_guard);
                video_pacer.unpause(None);
                return;
            };

            let audio_position = audio_pipeline.pacer.position().elapsed;
            audio_pipeline.pacer.pause();
            video_pacer.resync(Some(audio_position));
            let barrier = this.clock.now() + AV_REJOIN_BARRIER;
            audio_pipeline.pacer.unpause(Some(barrier));
            video_pacer.unpause(Some(barrier));
        });
    }

    /// Stops video playback, removes the track from every peer, and
    /// announces `video:false`.
    pub async fn stop_video(self: &Arc<Self>) {
        let existing = self.video.lock().await.take();
        if let Some(video) = existing {
            if let Some(pipeline) = video.pipeline.lock().await.take() {
                pipeline.pacer.stop();
                pipeline.decoder_stop.store(true, Ordering::SeqCst);
            }
            for entry in self.peers.iter() {
                let session = entry.value().clone();
                if let Err(err) = session.remove_video_track().await {
                    warn!(peer = %session.remote_id, error = %err, "failed to remove video track");
                }
            }
        }
        self.announce_video_state(false).await;
    }

    /// De-duplicated by last-sent value (spec.md §4.5 "Video-state
    /// announcement").
    async fn announce_video_state(&self, enabled: bool) {
        let mut last = self.last_video_state_sent.lock().await;
        if *last == Some(enabled) {
            return;
        }
        *last = Some(enabled);
        drop(last);

        let result = self
            .signalling
            .send(OutboundSignal::VideoState {
                channel_id: self.identity.channel_id.clone(),
                user_id: self.identity.local_peer_id.clone(),
                enabled,
            })
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to announce video state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::rtc::mock::MockFactory;
    use futures::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<OutboundSignal>>,
        inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<InboundSignal>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                inbound_rx: StdMutex::new(Some(rx)),
            })
        }
    }

    impl SignallingTransport for RecordingTransport {
        fn send(&self, event: OutboundSignal) -> BoxFuture<'_, Result<(), crate::error::SignallingError>> {
            self.sent.lock().unwrap().push(event);
            Box::pin(async { Ok(()) })
        }

        fn take_inbound(&self) -> mpsc::UnboundedReceiver<InboundSignal> {
            self.inbound_rx.lock().unwrap().take().expect("taken once")
        }
    }

    fn test_config() -> VoiceConnectionConfig {
        VoiceConnectionConfig {
            max_connected_peers: 2,
            ..VoiceConnectionConfig::default_for_test()
        }
    }

    fn make_conn() -> (
        Arc<VoiceConnection<MockFactory, VirtualClock>>,
        Arc<RecordingTransport>,
        Arc<VirtualClock>,
    ) {
        let identity = VoiceChannelIdentity {
            local_peer_id: "bot-1".to_string(),
            server_id: "srv-1".to_string(),
            channel_id: "chan-1".to_string(),
        };
        let clock = VirtualClock::new();
        let transport = RecordingTransport::new();
        let conn = VoiceConnection::new(
            identity,
            test_config(),
            Arc::new(MockFactory::default()),
            clock.clone(),
            transport.clone(),
        );
        (conn, transport, clock)
    }

    async fn advance_and_yield(clock: &VirtualClock, by: Duration) {
        clock.advance(by);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn join_sends_join_event_and_is_idempotent() {
        let (conn, transport, _clock) = make_conn();
        conn.join().await.unwrap();
        conn.join().await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|e| matches!(e, OutboundSignal::Join { .. })).count(), 1);
    }

    #[tokio::test]
    async fn leave_sends_leave_and_clears_state() {
        let (conn, transport, _clock) = make_conn();
        conn.join().await.unwrap();
        conn.set_peer_priority("p1", true);
        conn.leave().await.unwrap();

        assert!(!conn.connected());
        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().any(|e| matches!(e, OutboundSignal::Leave { .. })));
    }

    #[tokio::test]
    async fn admission_gate_rejects_over_capacity_unless_priority() {
        let (conn, _transport, clock) = make_conn();
        // max_connected_peers == 2 in test_config(); fake two existing peers
        // by driving admit_peer directly is avoidable here — exercise the
        // gate function against the configured capacity instead.
        for i in 0..2 {
            conn.admission.begin_negotiation();
            conn.admit_peer(&format!("existing-{i}")).await.unwrap();
            conn.admission.end_negotiation();
        }

        let now = clock.now();
        let tier = select_tier(conn.peer_count());
        assert!(!conn.admission_gates_pass("newcomer", now, &tier));

        conn.set_peer_priority("newcomer", true);
        assert!(conn.admission_gates_pass("newcomer", now, &tier));
    }

    #[tokio::test]
    async fn dispatch_single_joiner_enqueues_after_stagger() {
        let (conn, _transport, clock) = make_conn();
        conn.dispatch_single_joiner("user-2".to_string());

        assert!(!conn.admission.is_queued_for_test("user-2"));
        advance_and_yield(&clock, Duration::from_secs(2)).await;
        assert!(conn.admission.is_queued_for_test("user-2"));
    }

    #[tokio::test]
    async fn force_reconnect_broadcast_is_ignored() {
        let (conn, _transport, _clock) = make_conn();
        conn.admission.begin_negotiation();
        conn.admit_peer("p1").await.unwrap();
        conn.admission.end_negotiation();

        conn.handle_force_reconnect("*", "maintenance").await;
        assert_eq!(conn.peer_count(), 1);
        assert!(!conn.admission.is_queued_for_test("p1"));
    }

    #[tokio::test]
    async fn force_reconnect_self_requeues_every_peer() {
        let (conn, _transport, _clock) = make_conn();
        conn.admission.begin_negotiation();
        conn.admit_peer("p1").await.unwrap();
        conn.admission.end_negotiation();

        conn.handle_force_reconnect("bot-1", "renegotiate").await;
        assert_eq!(conn.peer_count(), 0);
        assert!(conn.admission.is_queued_for_test("p1"));
    }

    #[tokio::test]
    async fn video_state_announcement_is_deduplicated() {
        let (conn, transport, _clock) = make_conn();
        conn.announce_video_state(true).await;
        conn.announce_video_state(true).await;
        conn.announce_video_state(false).await;

        let sent = transport.sent.lock().unwrap();
        let video_events: Vec<_> = sent
            .iter()
            .filter_map(|e| match e {
                OutboundSignal::VideoState { enabled, .. } => Some(*enabled),
                _ => None,
            })
            .collect();
        assert_eq!(video_events, vec![true, false]);
    }

    #[tokio::test]
    async fn mass_join_of_sixty_batches_and_clears_flag() {
        let (conn, _transport, clock) = make_conn();
        // 60 candidates selects the "massive" tier (60 > large's 50-peer
        // cap) whose batch size is min(100, 20) = 20, so this lands on
        // spec.md §8 scenario 5's "tier = massive, batches = 3x20" exactly.
        let candidates: Vec<String> = (0..60).map(|i| format!("user-{i}")).collect();

        conn.dispatch_participant_list(candidates);
        assert!(conn.is_mass_join_active());

        // Too early for any batch: batch 0's earliest peer fires at
        // stagger_base = 2.5s.
        advance_and_yield(&clock, Duration::from_secs(2)).await;
        assert!(!conn.admission.is_queued_for_test("user-0"));
        assert!(!conn.admission.is_queued_for_test("user-40"));

        // Batch 0's last peer (index 19) fires at
        // stagger_base + 19*stagger_per_peer + jitter(<200ms) <= 17.9s.
        advance_and_yield(&clock, Duration::from_millis(15_900)).await;
        assert!(conn.admission.is_queued_for_test("user-19"));

        // Batch 2 (user-40..59) starts 10s after dispatch; its first peer
        // fires at 10s + 2.5s + jitter, comfortably within this window.
        advance_and_yield(&clock, Duration::from_secs(1)).await;
        assert!(conn.admission.is_queued_for_test("user-40"));

        // Settle = 2*batch_gap + last-batch's last-peer stagger + cooldown
        // = 10s + 17.7s + 10s = 37.7s; clears shortly after.
        advance_and_yield(&clock, Duration::from_secs(20)).await;
        assert!(!conn.is_mass_join_active());
    }

    #[tokio::test]
    async fn play_file_primes_decoder_and_finish_event_fires_on_clean_exit() {
        let (conn, _transport, _clock) = make_conn();
        let mut events = conn.take_playback_events().await;

        // A missing file makes the decoder exit immediately with a terminal
        // error rather than streaming frames, which is enough to exercise
        // the finish/error wiring without a real media file on disk.
        conn.play_file("/nonexistent/clip.wav", EffectConfig::default(), false)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("playback event should arrive")
            .expect("channel should not close");
        match event {
            PlaybackEvent::Error { kind, .. } => assert_eq!(kind, MediaKind::Audio),
            PlaybackEvent::Finished { .. } => panic!("missing file should not report a clean finish"),
        }
    }
}
