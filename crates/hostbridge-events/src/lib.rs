use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    fn now(kind: &str, payload: Value) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        }
    }
}

/// Relaxed counters for bus health. `events_in` counts publish calls,
/// `fanout` sums per-publish receiver deliveries, `dropped` counts
/// publishes that found no receiver at all, `lag_skips` accumulates frames
/// subscribers reported missing.
#[derive(Default)]
struct BusMetrics {
    events_in: AtomicU64,
    fanout: AtomicU64,
    dropped: AtomicU64,
    lag_skips: AtomicU64,
}

impl BusMetrics {
    fn record_publish(&self, delivered_to: Option<usize>) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
        match delivered_to {
            Some(n) => {
                self.fanout.fetch_add(n as u64, Ordering::Relaxed);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub lagged: u64,
    pub no_receivers: u64,
    pub receivers: usize,
}

/// Local in-process bus backed by a tokio broadcast channel.
///
/// Delivery is best-effort: slow subscribers lag and may drop frames, but the
/// in-memory state (HITL table, audit store) stays authoritative and a
/// reconnecting subscriber re-snapshots. A small replay ring lets late
/// subscribers catch recent history without a store round-trip.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    metrics: Arc<BusMetrics>,
    ring: Arc<Mutex<VecDeque<Envelope>>>,
    ring_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 256)
    }

    pub fn new_with_replay(capacity: usize, ring_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            metrics: Arc::new(BusMetrics::default()),
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(ring_cap))),
            ring_cap,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser": "error"}));
        let env = Envelope::now(kind, val);
        // Push-then-trim keeps the ring bounded even if the cap shrinks.
        {
            let mut ring = self.ring.lock().expect("replay ring poisoned");
            ring.push_back(env.clone());
            while ring.len() > self.ring_cap {
                ring.pop_front();
            }
        }
        self.metrics.record_publish(self.tx.send(env).ok());
    }

    /// Subscribe to a filtered view of the bus that forwards only events
    /// whose kind starts with any of the provided prefixes.
    pub fn subscribe_filtered(
        &self,
        prefixes: Vec<String>,
        capacity: Option<usize>,
    ) -> broadcast::Receiver<Envelope> {
        let (tx, rx) = broadcast::channel(capacity.unwrap_or(128));
        let mut src = self.tx.subscribe();
        let out = tx.clone();
        tokio::spawn(async move {
            loop {
                match src.recv().await {
                    Ok(env) => {
                        let k = env.kind.as_str();
                        if prefixes.iter().any(|p| k.starts_with(p)) {
                            let _ = out.send(env);
                        }
                        if out.receiver_count() == 0 {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Called by subscribers that observed a `Lagged` receive error.
    pub fn note_lag(&self, skipped: u64) {
        self.metrics.lag_skips.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        let m = &self.metrics;
        BusStats {
            published: m.events_in.load(Ordering::Relaxed),
            delivered: m.fanout.load(Ordering::Relaxed),
            lagged: m.lag_skips.load(Ordering::Relaxed),
            no_receivers: m.dropped.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }

    /// The most recent envelopes, oldest first, at most `n` of them.
    pub fn replay(&self, n: usize) -> Vec<Envelope> {
        let ring = self.ring.lock().expect("replay ring poisoned");
        let mut tail: Vec<Envelope> = ring.iter().rev().take(n).cloned().collect();
        tail.reverse();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("hitl.request.created", &json!({"id": "r1"}));
        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, "hitl.request.created");
        assert_eq!(env.payload["id"], "r1");
    }

    #[tokio::test]
    async fn filtered_subscription_drops_other_prefixes() {
        let bus = Bus::new(16);
        // The source receiver is attached synchronously inside
        // subscribe_filtered, so nothing published afterwards is missed.
        let mut rx = bus.subscribe_filtered(vec!["audit.".to_string()], None);
        bus.publish("hitl.request.created", &json!({"id": "r1"}));
        bus.publish("audit.entry.appended", &json!({"id": "a1"}));
        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, "audit.entry.appended");
    }

    #[tokio::test]
    async fn replay_returns_recent_in_order() {
        let bus = Bus::new_with_replay(16, 2);
        bus.publish("audit.entry.appended", &json!({"n": 1}));
        bus.publish("audit.entry.appended", &json!({"n": 2}));
        bus.publish("audit.entry.appended", &json!({"n": 3}));
        let tail = bus.replay(10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].payload["n"], 2);
        assert_eq!(tail[1].payload["n"], 3);
        // Asking for fewer than are buffered returns the newest ones.
        let last = bus.replay(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].payload["n"], 3);
    }

    #[test]
    fn stats_count_unreceived_publishes() {
        let bus = Bus::new(16);
        bus.publish("plan.created", &json!({}));
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.no_receivers, 1);
        assert_eq!(stats.delivered, 0);
        bus.note_lag(3);
        assert_eq!(bus.stats().lagged, 3);
    }
}
