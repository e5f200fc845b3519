//! `AdmissionQueue` and tiered-dispatch scheduling (spec.md §3, §4.5).
//!
//! No teacher file has admission tiers — the SFU's `Room::add_peer` in
//! `server/src/voice/sfu.rs` is a flat capacity check with no queue, no
//! cooldown, no stagger. The queue/cooldown bookkeeping here is built fresh
//! from spec.md §4.5/§8 in the same `Mutex`-guarded-state style the teacher
//! uses for `Room`'s other fields; the retry-with-backoff *spawn* shape
//! (`server/src/voice/ws_handler.rs::handle_leave`'s background task) is
//! reused for the per-peer staggered-enqueue tasks in `connection.rs`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::TierRow;

/// FIFO of peer IDs pending admission, plus the cooldown/in-flight
/// bookkeeping the orchestrator's pump loop consults (spec.md §3
/// `AdmissionQueue`).
pub struct AdmissionQueue {
    queue: Mutex<VecDeque<String>>,
    queued: Mutex<HashSet<String>>,
    cooldowns: Mutex<std::collections::HashMap<String, Instant>>,
    active_negotiations: AtomicUsize,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            queued: Mutex::new(HashSet::new()),
            cooldowns: Mutex::new(std::collections::HashMap::new()),
            active_negotiations: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `peer_id` if it is not already present (spec.md §3
    /// invariant: "a peer ID occurs at most once in the queue"). Returns
    /// `false` if it was already queued.
    pub fn enqueue(&self, peer_id: String) -> bool {
        let mut queued = self.queued.lock().unwrap();
        if !queued.insert(peer_id.clone()) {
            return false;
        }
        self.queue.lock().unwrap().push_back(peer_id);
        true
    }

    pub fn dequeue(&self) -> Option<String> {
        let peer_id = self.queue.lock().unwrap().pop_front()?;
        self.queued.lock().unwrap().remove(&peer_id);
        Some(peer_id)
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
        self.queued.lock().unwrap().clear();
        self.active_negotiations.store(0, Ordering::SeqCst);
    }

    /// `false` if `peer_id`'s last attempt was within `cooldown` of `now`
    /// (spec.md §4.5 admission gate 2: "drop silently").
    pub fn cooldown_ready(&self, peer_id: &str, now: Instant, cooldown: Duration) -> bool {
        match self.cooldowns.lock().unwrap().get(peer_id) {
            Some(last) => now.saturating_duration_since(*last) >= cooldown,
            None => true,
        }
    }

    /// Records `now` as the last admission attempt. Cooldown timestamps
    /// never move backwards (spec.md §3 invariant).
    pub fn record_attempt(&self, peer_id: &str, now: Instant) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let entry = cooldowns.entry(peer_id.to_string()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }

    pub fn active_negotiations(&self) -> usize {
        self.active_negotiations.load(Ordering::SeqCst)
    }

    pub fn begin_negotiation(&self) {
        self.active_negotiations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_negotiation(&self) {
        self.active_negotiations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .ok();
    }

    #[cfg(test)]
    pub(crate) fn is_queued_for_test(&self, peer_id: &str) -> bool {
        self.queued.lock().unwrap().contains(peer_id)
    }
}

/// Delay before the peer at `index` in a participant-list dispatch is
/// enqueued (spec.md §4.5 "participant-list dispatch": `stagger_base +
/// index * stagger_per_peer`; jitter is added by the caller via [`jitter`]).
pub fn participant_stagger(tier: &TierRow, index: usize) -> Duration {
    Duration::from_millis(tier.stagger_base_ms + index as u64 * tier.stagger_per_peer_ms)
}

/// Delay for a single `user-joined` arrival (spec.md §4.5 "Single joiner":
/// grows gently with crowd size via `0.5 * |peers| * stagger_per_peer`).
pub fn single_joiner_stagger(tier: &TierRow, current_peer_count: usize) -> Duration {
    let growth = (current_peer_count as u64 * tier.stagger_per_peer_ms) / 2;
    Duration::from_millis(tier.stagger_base_ms + growth)
}

/// Uniform jitter in `[0, max_ms)`, added on top of a stagger delay so
/// simultaneous dispatches don't all land on the same millisecond.
pub fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Splits `candidates` into batches of `min(tier.max_peers, 20)` for
/// mass-join dispatch (spec.md §4.5 "If N > tier.max_peers").
pub fn mass_join_batches(candidates: &[String], tier: &TierRow) -> Vec<Vec<String>> {
    let batch_size = tier.max_peers.min(20).max(1);
    candidates.chunks(batch_size).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TIERS;

    #[test]
    fn enqueue_rejects_duplicates() {
        let q = AdmissionQueue::new();
        assert!(q.enqueue("p1".to_string()));
        assert!(!q.enqueue("p1".to_string()));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn dequeue_is_fifo_and_allows_requeue() {
        let q = AdmissionQueue::new();
        q.enqueue("p1".to_string());
        q.enqueue("p2".to_string());
        assert_eq!(q.dequeue().as_deref(), Some("p1"));
        assert_eq!(q.dequeue().as_deref(), Some("p2"));
        assert_eq!(q.dequeue(), None);

        // Once dequeued, the same ID may be enqueued again.
        assert!(q.enqueue("p1".to_string()));
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let q = AdmissionQueue::new();
        let t0 = Instant::now();
        q.record_attempt("p1", t0);
        assert!(!q.cooldown_ready("p1", t0 + Duration::from_millis(500), Duration::from_secs(1)));
        assert!(q.cooldown_ready("p1", t0 + Duration::from_secs(2), Duration::from_secs(1)));
    }

    #[test]
    fn active_negotiations_never_go_negative() {
        let q = AdmissionQueue::new();
        q.end_negotiation();
        assert_eq!(q.active_negotiations(), 0);
        q.begin_negotiation();
        q.begin_negotiation();
        assert_eq!(q.active_negotiations(), 2);
        q.end_negotiation();
        assert_eq!(q.active_negotiations(), 1);
    }

    #[test]
    fn mass_join_batches_cap_at_twenty() {
        let tier = TIERS.iter().find(|t| t.name == "massive").unwrap();
        let candidates: Vec<String> = (0..60).map(|i| format!("p{i}")).collect();
        let batches = mass_join_batches(&candidates, tier);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 20));
    }

    #[test]
    fn participant_stagger_matches_small_tier_example() {
        let tier = TIERS.iter().find(|t| t.name == "small").unwrap();
        // N = 10: last peer (index 9) staggered at stagger_base + 9*stagger_per_peer.
        let last = participant_stagger(tier, 9);
        assert_eq!(last, Duration::from_millis(300 + 9 * 200));
    }
}
