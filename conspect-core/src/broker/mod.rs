//! Subscription broker: fans emitted snapshots out to subscribers and
//! answers synchronous queries.
//!
//! ## Delivery policies
//!
//! | Policy | Queue behavior when full |
//! |--------|--------------------------|
//! | `DropOldest` | discard the earliest undelivered snapshot |
//! | `CoalesceLatest` | keep only the newest pending snapshot |
//! | `BlockUpTo(T)` | wait up to T; a timeout is a slow-subscriber strike |
//!
//! Three strikes inside one minute demote a `BlockUpTo` subscriber to
//! `CoalesceLatest`. `latest()` is the lock-free fast path: an atomically
//! swapped pointer to the current snapshot. Each subscriber observes
//! snapshots in strictly increasing sequence order, modulo drops its policy
//! permits.
//!
//! The broker keeps a drain handle on every subscriber queue (crossbeam
//! channels are MPMC) so it can discard pending snapshots from the publish
//! side; subscriber liveness is tracked through an `Arc` token owned by the
//! `Subscription`, since the drain handle keeps the channel itself open.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::fusion::context::ContextSnapshot;

/// Predicate over snapshot fields; `None` passes everything.
pub type FilterPredicate = Box<dyn Fn(&ContextSnapshot) -> bool + Send + Sync>;

/// Per-subscriber rule for undeliverable snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    DropOldest,
    CoalesceLatest,
    BlockUpTo(Duration),
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::CoalesceLatest
    }
}

/// Strikes inside the window that trigger demotion.
const STRIKE_LIMIT: usize = 3;
const STRIKE_WINDOW: Duration = Duration::from_secs(60);

/// Queue depth for `DropOldest` / `BlockUpTo` subscribers.
const QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Snapshot ring length served by `history()`.
    pub history_size: usize,
    pub default_policy: BackpressurePolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            default_policy: BackpressurePolicy::CoalesceLatest,
        }
    }
}

/// A consumer's registration, returned by `subscribe`. Dropping it ends the
/// subscription; the broker reaps the entry on its next publish.
pub struct Subscription {
    id: u64,
    receiver: Receiver<Arc<ContextSnapshot>>,
    _alive: Arc<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<Arc<ContextSnapshot>> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<Arc<ContextSnapshot>> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<ContextSnapshot>> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

struct SubscriberEntry {
    id: u64,
    tx: Sender<Arc<ContextSnapshot>>,
    /// Publish-side drain handle for DropOldest / CoalesceLatest.
    drain: Receiver<Arc<ContextSnapshot>>,
    alive: Weak<()>,
    filter: Option<FilterPredicate>,
    policy: BackpressurePolicy,
    strikes: Vec<Instant>,
}

/// Publishes context updates and stores the queryable state.
pub struct SubscriptionBroker {
    config: BrokerConfig,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    latest: ArcSwapOption<ContextSnapshot>,
    history: Mutex<VecDeque<Arc<ContextSnapshot>>>,
    next_id: AtomicU64,
    demoted: AtomicUsize,
}

impl SubscriptionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(Vec::new()),
            latest: ArcSwapOption::empty(),
            history: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            demoted: AtomicUsize::new(0),
        }
    }

    /// Register a subscriber. `policy` defaults to the broker's configured
    /// default (`CoalesceLatest` unless overridden).
    pub fn subscribe(
        &self,
        filter: Option<FilterPredicate>,
        policy: Option<BackpressurePolicy>,
    ) -> Subscription {
        let policy = policy.unwrap_or(self.config.default_policy);
        let capacity = match policy {
            BackpressurePolicy::CoalesceLatest => 1,
            _ => QUEUE_CAPACITY,
        };
        let (tx, rx) = bounded(capacity);
        let alive = Arc::new(());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(SubscriberEntry {
            id,
            tx,
            drain: rx.clone(),
            alive: Arc::downgrade(&alive),
            filter,
            policy,
            strikes: Vec::new(),
        });
        debug!(subscriber = id, ?policy, "subscriber registered");
        Subscription {
            id,
            receiver: rx,
            _alive: alive,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() < before {
            debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Last emitted snapshot, or `None` before the first emission.
    /// Lock-free fast path.
    pub fn latest(&self) -> Option<Arc<ContextSnapshot>> {
        self.latest.load_full()
    }

    /// Up to the `n` most recent snapshots, oldest first.
    pub fn history(&self, n: usize) -> Vec<Arc<ContextSnapshot>> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Subscribers demoted for repeated delivery timeouts.
    pub fn slow_subscriber_count(&self) -> usize {
        self.demoted.load(Ordering::Relaxed)
    }

    /// Fan one snapshot out to every matching subscriber and record it for
    /// `latest()` / `history()`.
    pub fn publish(&self, snapshot: Arc<ContextSnapshot>) {
        self.latest.store(Some(Arc::clone(&snapshot)));
        {
            let mut history = self.history.lock();
            if history.len() == self.config.history_size {
                history.pop_front();
            }
            history.push_back(Arc::clone(&snapshot));
        }

        let mut subscribers = self.subscribers.lock();
        let mut gone: Vec<u64> = Vec::new();
        for entry in subscribers.iter_mut() {
            if entry.alive.upgrade().is_none() {
                gone.push(entry.id);
                continue;
            }
            if let Some(filter) = &entry.filter {
                if !filter(&snapshot) {
                    continue;
                }
            }
            deliver(entry, Arc::clone(&snapshot), &self.demoted);
        }
        if !gone.is_empty() {
            subscribers.retain(|s| !gone.contains(&s.id));
            info!(count = gone.len(), "reaped dropped subscribers");
        }
    }
}

impl Default for SubscriptionBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

fn deliver(entry: &mut SubscriberEntry, snapshot: Arc<ContextSnapshot>, demoted: &AtomicUsize) {
    match entry.policy {
        BackpressurePolicy::DropOldest => {
            if let Err(TrySendError::Full(snapshot)) = entry.tx.try_send(snapshot) {
                // Discard the earliest undelivered snapshot, then retry.
                let _ = entry.drain.try_recv();
                let _ = entry.tx.try_send(snapshot);
            }
        }
        BackpressurePolicy::CoalesceLatest => {
            // Overwrite whatever is pending with the newest. The queue may
            // be larger than one slot after a demotion.
            while entry.drain.try_recv().is_ok() {}
            let _ = entry.tx.try_send(snapshot);
        }
        BackpressurePolicy::BlockUpTo(timeout) => {
            if let Err(SendTimeoutError::Timeout(_)) = entry.tx.send_timeout(snapshot, timeout) {
                let now = Instant::now();
                entry
                    .strikes
                    .retain(|s| now.duration_since(*s) < STRIKE_WINDOW);
                entry.strikes.push(now);
                warn!(
                    subscriber = entry.id,
                    strikes = entry.strikes.len(),
                    "slow subscriber — delivery timed out"
                );
                if entry.strikes.len() >= STRIKE_LIMIT {
                    warn!(
                        subscriber = entry.id,
                        "demoting slow subscriber to coalesce-latest"
                    );
                    entry.policy = BackpressurePolicy::CoalesceLatest;
                    entry.strikes.clear();
                    demoted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::classifier::AudioClass;
    use crate::fusion::context::{AudioSummary, ContextTag, ScreenSummary, SnapshotKind};
    use chrono::Utc;

    fn snapshot(seq: u64, tag: ContextTag) -> Arc<ContextSnapshot> {
        Arc::new(ContextSnapshot {
            seq,
            parent_seq: seq.checked_sub(1),
            timestamp: Utc::now(),
            kind: SnapshotKind::Update,
            primary: tag,
            secondary: None,
            confidence: 0.5,
            correlation: 1.0,
            screen: ScreenSummary::empty(),
            audio: AudioSummary {
                class: AudioClass::Silence,
                source_app: None,
                confidence: 0.9,
            },
            ocr_frame_id: None,
            ocr_timestamp: None,
            audio_timestamp: None,
        })
    }

    #[test]
    fn latest_is_none_before_first_emission_then_tracks_newest() {
        let broker = SubscriptionBroker::default();
        assert!(broker.latest().is_none());
        broker.publish(snapshot(0, ContextTag::Idle));
        broker.publish(snapshot(1, ContextTag::FocusedWork));
        assert_eq!(broker.latest().unwrap().seq, 1);
    }

    #[test]
    fn history_returns_most_recent_in_order_and_is_bounded() {
        let broker = SubscriptionBroker::new(BrokerConfig {
            history_size: 5,
            default_policy: BackpressurePolicy::CoalesceLatest,
        });
        for seq in 0..8 {
            broker.publish(snapshot(seq, ContextTag::Idle));
        }
        let history = broker.history(3);
        let seqs: Vec<u64> = history.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![5, 6, 7]);
        assert_eq!(broker.history(100).len(), 5);
    }

    #[test]
    fn drop_oldest_discards_earliest_when_full() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, Some(BackpressurePolicy::DropOldest));
        for seq in 0..(QUEUE_CAPACITY as u64 + 3) {
            broker.publish(snapshot(seq, ContextTag::Idle));
        }
        let first = sub.try_recv().expect("queue should have snapshots");
        // Earliest three were discarded.
        assert_eq!(first.seq, 3);
        let mut last = first.seq;
        while let Some(s) = sub.try_recv() {
            assert!(s.seq > last, "ordering violated: {} after {last}", s.seq);
            last = s.seq;
        }
        assert_eq!(last, QUEUE_CAPACITY as u64 + 2);
    }

    #[test]
    fn coalesce_latest_keeps_only_newest() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, Some(BackpressurePolicy::CoalesceLatest));
        for seq in 0..5 {
            broker.publish(snapshot(seq, ContextTag::Idle));
        }
        assert_eq!(sub.try_recv().unwrap().seq, 4);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn block_up_to_demotes_after_three_strikes() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(
            None,
            Some(BackpressurePolicy::BlockUpTo(Duration::from_millis(20))),
        );
        // Fill the queue, then force three timed-out deliveries.
        for seq in 0..(QUEUE_CAPACITY as u64 + 3) {
            broker.publish(snapshot(seq, ContextTag::Idle));
        }
        assert_eq!(broker.slow_subscriber_count(), 1);

        // Demoted to coalesce-latest: draining then publishing twice leaves
        // only the newest pending.
        while sub.try_recv().is_some() {}
        broker.publish(snapshot(100, ContextTag::Idle));
        broker.publish(snapshot(101, ContextTag::Idle));
        let pending = sub.try_recv().unwrap();
        assert_eq!(pending.seq, 101);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn filter_predicate_limits_delivery() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(
            Some(Box::new(|s: &ContextSnapshot| {
                s.primary == ContextTag::Meeting
            })),
            Some(BackpressurePolicy::DropOldest),
        );
        broker.publish(snapshot(0, ContextTag::Idle));
        broker.publish(snapshot(1, ContextTag::Meeting));
        broker.publish(snapshot(2, ContextTag::Idle));
        assert_eq!(sub.try_recv().unwrap().seq, 1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, Some(BackpressurePolicy::DropOldest));
        broker.unsubscribe(sub.id());
        broker.publish(snapshot(0, ContextTag::Idle));
        assert!(sub.try_recv().is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscription_is_reaped_on_publish() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, Some(BackpressurePolicy::DropOldest));
        drop(sub);
        broker.publish(snapshot(0, ContextTag::Idle));
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn resubscribe_sees_sequence_at_or_after_previous() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, Some(BackpressurePolicy::DropOldest));
        broker.publish(snapshot(0, ContextTag::Idle));
        let seen = sub.try_recv().unwrap().seq;
        broker.unsubscribe(sub.id());

        let sub2 = broker.subscribe(None, Some(BackpressurePolicy::DropOldest));
        broker.publish(snapshot(1, ContextTag::Idle));
        let next = sub2.try_recv().unwrap().seq;
        assert!(next >= seen);
    }

    #[test]
    fn coalesce_capacity_one_delivers_when_consumer_keeps_up() {
        let broker = SubscriptionBroker::default();
        let sub = broker.subscribe(None, None); // default policy
        broker.publish(snapshot(0, ContextTag::Idle));
        assert_eq!(sub.try_recv().unwrap().seq, 0);
        broker.publish(snapshot(1, ContextTag::Idle));
        assert_eq!(sub.try_recv().unwrap().seq, 1);
    }
}
