//! Per-job event fan-out: a bounded replay ring plus a live broadcast lane.
//!
//! The runner is the only publisher for a job, so events are totally
//! ordered by a per-topic sequence starting at 1. Subscribers replay missed
//! events from the ring (up to its capacity) and then follow the broadcast
//! lane; a `Last-Event-ID` older than the retained window yields a replay
//! gap marker and resumes from newest. Slow consumers lag on their own
//! broadcast buffer and never block the publisher or the ring.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::{Envelope, EventPayload};

/// Events retained per job for reconnect replay.
const RING_CAPACITY: usize = 256;
/// Live-lane buffer per subscriber before lagging.
const BROADCAST_CAPACITY: usize = 256;

struct TopicState {
    next_seq: u64,
    ring: VecDeque<Envelope>,
}

struct Topic {
    state: Mutex<TopicState>,
    tx: broadcast::Sender<Envelope>,
}

impl Topic {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(TopicState {
                next_seq: 1,
                ring: VecDeque::with_capacity(RING_CAPACITY),
            }),
            tx,
        }
    }
}

/// What a new subscriber gets: any ring replay, whether a gap preceded it,
/// and the live receiver.
pub struct Subscription {
    pub replay: Vec<Envelope>,
    pub gap: bool,
    pub live: broadcast::Receiver<Envelope>,
}

pub struct EventBus {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    global_tx: broadcast::Sender<Envelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (global_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            topics: Mutex::new(HashMap::new()),
            global_tx,
        }
    }

    fn topic(&self, job_id: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock();
        Arc::clone(
            topics
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Topic::new())),
        )
    }

    /// Publish one event for `job_id`; returns the assigned sequence id.
    ///
    /// The ring update and the live send happen under the topic lock, so a
    /// subscriber attaching concurrently sees each event exactly once —
    /// either in its replay or on the live lane, never both.
    pub fn publish(&self, job_id: &str, payload: EventPayload) -> u64 {
        let topic = self.topic(job_id);
        let mut state = topic.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let envelope = Envelope {
            seq,
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        if state.ring.len() == RING_CAPACITY {
            state.ring.pop_front();
        }
        state.ring.push_back(envelope.clone());

        if envelope.payload.on_global_lane() {
            let _ = self.global_tx.send(envelope.clone());
        }
        let _ = topic.tx.send(envelope);
        seq
    }

    /// Latest assigned sequence for a job (0 when nothing was published).
    pub fn last_seq(&self, job_id: &str) -> u64 {
        self.topic(job_id).state.lock().next_seq - 1
    }

    /// Subscribe to one job's events, replaying everything after
    /// `last_event_id` that the ring still holds.
    pub fn subscribe(&self, job_id: &str, last_event_id: Option<u64>) -> Subscription {
        let topic = self.topic(job_id);
        let state = topic.state.lock();
        let live = topic.tx.subscribe();

        let Some(after) = last_event_id else {
            return Subscription {
                replay: Vec::new(),
                gap: false,
                live,
            };
        };

        let oldest_retained = state.ring.front().map(|e| e.seq);
        let gap = match oldest_retained {
            // The subscriber missed events the ring no longer holds.
            Some(oldest) => after + 1 < oldest,
            None => after + 1 < state.next_seq,
        };
        let replay = if gap {
            debug!(job_id, after, "replay window exceeded — resuming from newest");
            Vec::new()
        } else {
            state
                .ring
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect()
        };
        Subscription { replay, gap, live }
    }

    /// The cross-job lane: `signal.*` and `progress.overall` for all jobs.
    pub fn subscribe_global(&self) -> broadcast::Receiver<Envelope> {
        self.global_tx.subscribe()
    }

    /// Drop a finished job's topic (ring included). Late subscribers start
    /// from an empty topic.
    pub fn remove_topic(&self, job_id: &str) {
        self.topics.lock().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Signal;

    fn signal(s: Signal) -> EventPayload {
        EventPayload::Signal {
            signal: s,
            message: None,
        }
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("a", signal(Signal::JobStart)), 1);
        assert_eq!(bus.publish("a", signal(Signal::PhaseStart)), 2);
        // Independent per topic.
        assert_eq!(bus.publish("b", signal(Signal::JobStart)), 1);
        assert_eq!(bus.last_seq("a"), 2);
    }

    #[test]
    fn subscribe_replays_after_last_event_id() {
        let bus = EventBus::new();
        for _ in 0..8 {
            bus.publish("a", signal(Signal::PhaseStart));
        }
        let sub = bus.subscribe("a", Some(5));
        assert!(!sub.gap);
        let seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8]);
    }

    #[test]
    fn fresh_subscription_with_zero_replays_everything() {
        let bus = EventBus::new();
        for _ in 0..3 {
            bus.publish("a", signal(Signal::PhaseStart));
        }
        let sub = bus.subscribe("a", Some(0));
        assert_eq!(sub.replay.len(), 3);
        assert!(!sub.gap);
    }

    #[test]
    fn overflow_yields_gap_and_resumes_from_newest() {
        let bus = EventBus::new();
        for _ in 0..(RING_CAPACITY + 10) {
            bus.publish("a", signal(Signal::PhaseStart));
        }
        let sub = bus.subscribe("a", Some(2));
        assert!(sub.gap);
        assert!(sub.replay.is_empty());

        // Recent ids still replay without a gap.
        let sub = bus.subscribe("a", Some(RING_CAPACITY as u64 + 5));
        assert!(!sub.gap);
        assert_eq!(sub.replay.len(), 5);
    }

    #[tokio::test]
    async fn live_lane_receives_after_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("a", None);
        bus.publish("a", signal(Signal::JobStart));
        let env = sub.live.recv().await.unwrap();
        assert_eq!(env.seq, 1);
        assert_eq!(env.job_id, "a");
    }

    #[tokio::test]
    async fn global_lane_multiplexes_signals_only() {
        let bus = EventBus::new();
        let mut global = bus.subscribe_global();
        bus.publish(
            "a",
            EventPayload::ProgressPhase {
                phase: crate::job::Phase::Extract,
                items_done: 0,
                items_total: 1,
                message: String::new(),
            },
        );
        bus.publish("b", signal(Signal::JobComplete));
        let env = global.recv().await.unwrap();
        assert_eq!(env.job_id, "b");
    }
}
