//! Per-peer debounce aggregation of inbound message bursts.
//!
//! The gateway delivers every line a user sends as its own callback, while
//! backends expect one semantic turn. Each peer keeps at most one pending
//! turn and one live single-shot timer; every enqueue appends a line and
//! reschedules the timer, and the flush that wins the generation check takes
//! the turn as an immutable snapshot. The map lock is never held across the
//! turn-ready callback, so a slow backend cannot block message intake.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[async_trait]
pub trait TurnHandler: Send + Sync {
    /// Receives one combined turn. Delivery failures are the handler's to
    /// log; the aggregator never re-queues a flushed turn.
    async fn handle_turn(&self, peer: &str, text: &str);
}

struct PendingTurn {
    lines: Vec<String>,
    /// Bumped on every enqueue; a timer only flushes the generation it was
    /// scheduled for, so a reschedule that races an in-flight fire is a no-op.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    turns: Mutex<HashMap<String, PendingTurn>>,
    quiet_ms: AtomicU64,
    handler: Arc<dyn TurnHandler>,
}

#[derive(Clone)]
pub struct DebounceAggregator {
    inner: Arc<Inner>,
}

impl DebounceAggregator {
    pub fn new(quiet_period: Duration, handler: Arc<dyn TurnHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                turns: Mutex::new(HashMap::new()),
                quiet_ms: AtomicU64::new(quiet_period.as_millis() as u64),
                handler,
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.inner.quiet_ms.load(Ordering::Relaxed))
    }

    /// Runtime adjustment from the settings surface; applies to the next
    /// reschedule, timers already armed keep their deadline.
    pub fn set_quiet_period(&self, quiet_period: Duration) {
        self.inner
            .quiet_ms
            .store(quiet_period.as_millis() as u64, Ordering::Relaxed);
    }

    /// Appends `line` to the peer's pending turn and (re)schedules its
    /// flush timer, cancelling any previously armed one.
    pub fn enqueue(&self, peer: &str, line: impl Into<String>) {
        let quiet = self.quiet_period();
        let mut turns = self.inner.turns.lock();
        let turn = turns.entry(peer.to_string()).or_insert_with(|| PendingTurn {
            lines: Vec::new(),
            generation: 0,
            timer: None,
        });
        turn.lines.push(line.into());
        turn.generation += 1;
        if let Some(previous) = turn.timer.take() {
            previous.abort();
        }
        let generation = turn.generation;
        let inner = Arc::clone(&self.inner);
        let peer_key = peer.to_string();
        turn.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            flush(inner, &peer_key, generation).await;
        }));
    }

    /// Graceful-shutdown path: delivers every pending turn immediately and
    /// disarms the timers that would have fired later.
    pub async fn flush_all(&self) {
        let drained: Vec<(String, PendingTurn)> = {
            let mut turns = self.inner.turns.lock();
            turns.drain().collect()
        };
        for (peer, turn) in drained {
            if let Some(timer) = turn.timer {
                timer.abort();
            }
            if turn.lines.is_empty() {
                continue;
            }
            let text = turn.lines.join("\n");
            self.inner.handler.handle_turn(&peer, &text).await;
        }
    }

    #[cfg(test)]
    fn pending_peers(&self) -> usize {
        self.inner.turns.lock().len()
    }
}

/// Timer-fired flush. Takes ownership of the pending turn if the generation
/// still matches, then delivers outside the lock. A lost generation race or
/// an already-taken turn is a no-op.
async fn flush(inner: Arc<Inner>, peer: &str, generation: u64) {
    let taken = {
        let mut turns = inner.turns.lock();
        match turns.get(peer) {
            Some(turn) if turn.generation == generation && !turn.lines.is_empty() => {
                turns.remove(peer)
            }
            _ => None,
        }
    };
    let Some(turn) = taken else {
        return;
    };
    let text = turn.lines.join("\n");
    debug!(peer, lines = turn.lines.len(), "flushing combined turn");
    inner.handler.handle_turn(peer, &text).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingHandler {
        turns: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TurnHandler for RecordingHandler {
        async fn handle_turn(&self, peer: &str, text: &str) {
            self.turns.lock().push((peer.to_string(), text.to_string()));
        }
    }

    #[derive(Default)]
    struct SlowHandler {
        turns: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TurnHandler for SlowHandler {
        async fn handle_turn(&self, peer: &str, text: &str) {
            sleep(Duration::from_millis(200)).await;
            self.turns.lock().push((peer.to_string(), text.to_string()));
        }
    }

    #[tokio::test]
    async fn burst_within_quiet_period_flushes_once() {
        let handler = Arc::new(RecordingHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_millis(50), handler.clone());

        aggregator.enqueue("u1", "one");
        aggregator.enqueue("u1", "two");
        aggregator.enqueue("u1", "three");
        sleep(Duration::from_millis(150)).await;

        let turns = handler.turns.lock().clone();
        assert_eq!(turns, vec![("u1".to_string(), "one\ntwo\nthree".to_string())]);
        assert_eq!(aggregator.pending_peers(), 0);
    }

    #[tokio::test]
    async fn gap_beyond_quiet_period_produces_separate_turns() {
        let handler = Arc::new(RecordingHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_millis(40), handler.clone());

        aggregator.enqueue("u1", "first");
        sleep(Duration::from_millis(120)).await;
        aggregator.enqueue("u1", "second");
        sleep(Duration::from_millis(120)).await;

        let turns = handler.turns.lock().clone();
        assert_eq!(
            turns,
            vec![
                ("u1".to_string(), "first".to_string()),
                ("u1".to_string(), "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn enqueue_keeps_resetting_the_timer() {
        let handler = Arc::new(RecordingHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_millis(80), handler.clone());

        for line in ["a", "b", "c", "d"] {
            aggregator.enqueue("u1", line);
            sleep(Duration::from_millis(40)).await;
        }
        assert!(handler.turns.lock().is_empty());
        sleep(Duration::from_millis(150)).await;
        let turns = handler.turns.lock().clone();
        assert_eq!(turns, vec![("u1".to_string(), "a\nb\nc\nd".to_string())]);
    }

    #[tokio::test]
    async fn peers_are_isolated() {
        let handler = Arc::new(RecordingHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_millis(50), handler.clone());

        let mut tasks = Vec::new();
        for peer in ["u1", "u2", "u3", "u4"] {
            let aggregator = aggregator.clone();
            tasks.push(tokio::spawn(async move {
                for index in 0..3 {
                    aggregator.enqueue(peer, format!("{peer}-{index}"));
                }
            }));
        }
        for task in tasks {
            task.await.expect("enqueue task");
        }
        sleep(Duration::from_millis(150)).await;

        let turns = handler.turns.lock().clone();
        assert_eq!(turns.len(), 4);
        for peer in ["u1", "u2", "u3", "u4"] {
            let text = turns
                .iter()
                .find(|(p, _)| p == peer)
                .map(|(_, t)| t.clone())
                .expect("turn for peer");
            assert_eq!(text, format!("{peer}-0\n{peer}-1\n{peer}-2"));
        }
    }

    #[tokio::test]
    async fn enqueue_during_slow_delivery_starts_a_fresh_turn() {
        let handler = Arc::new(SlowHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_millis(30), handler.clone());

        aggregator.enqueue("u1", "first");
        // Let the flush take ownership, then enqueue while the handler is
        // still sleeping inside delivery.
        sleep(Duration::from_millis(60)).await;
        aggregator.enqueue("u1", "second");
        sleep(Duration::from_millis(500)).await;

        let turns = handler.turns.lock().clone();
        assert_eq!(
            turns,
            vec![
                ("u1".to_string(), "first".to_string()),
                ("u1".to_string(), "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn flush_all_delivers_pending_turns() {
        let handler = Arc::new(RecordingHandler::default());
        let aggregator = DebounceAggregator::new(Duration::from_secs(600), handler.clone());

        aggregator.enqueue("u1", "bye");
        aggregator.flush_all().await;

        let turns = handler.turns.lock().clone();
        assert_eq!(turns, vec![("u1".to_string(), "bye".to_string())]);
        assert_eq!(aggregator.pending_peers(), 0);
    }
}
