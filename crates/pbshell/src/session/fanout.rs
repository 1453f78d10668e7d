//! Session output fan-out.
//!
//! Every chunk produced for a session, remote output and notices alike, is
//! pushed once and copied into an independent unbounded queue per
//! subscriber. Consumers never compete for the same queue, so the display
//! relay and the prompt-wait watcher each see the complete stream in the
//! same order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pbshell_protocol::Notice;
use tokio::sync::mpsc;

/// Identifier of a subscriber within one fan-out.
pub type SubscriberId = u64;

/// Statistics about a subscriber's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Chunks delivered to the subscriber's queue.
    pub chunks_delivered: u64,
    /// Bytes delivered to the subscriber's queue.
    pub bytes_delivered: u64,
}

struct Subscriber {
    id: SubscriberId,
    label: String,
    tx: mpsc::UnboundedSender<String>,
    stats: SubscriberStats,
}

impl Subscriber {
    /// Queues a chunk; returns false once the receiver is gone.
    fn deliver(&mut self, chunk: &str) -> bool {
        if self.tx.send(chunk.to_string()).is_err() {
            return false;
        }
        self.stats.chunks_delivered += 1;
        self.stats.bytes_delivered += chunk.len() as u64;
        true
    }
}

/// Receiving end of one subscription.
///
/// Dropping it unsubscribes on the next push.
#[derive(Debug)]
pub struct OutputReceiver {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputReceiver {
    /// Returns the subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next chunk. Returns `None` once the fan-out is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Takes the next chunk if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Takes every chunk queued right now, in order.
    pub fn drain(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }
}

/// Single producer side broadcasting to per-subscriber queues.
///
/// Cloning yields another handle to the same fan-out.
#[derive(Clone, Default)]
pub struct OutputFanout {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl OutputFanout {
    /// Creates a fan-out with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber that receives every chunk pushed from now on.
    pub fn subscribe(&self, label: impl Into<String>) -> OutputReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        tracing::debug!(subscriber_id = id, label = %label, "Added output subscriber");
        self.subscribers.lock().push(Subscriber {
            id,
            label,
            tx,
            stats: SubscriberStats::default(),
        });
        OutputReceiver { id, rx }
    }

    /// Removes a subscriber, returning its statistics if it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<SubscriberStats> {
        let mut subscribers = self.subscribers.lock();
        let pos = subscribers.iter().position(|s| s.id == id)?;
        Some(subscribers.remove(pos).stats)
    }

    /// Pushes a chunk to every subscriber.
    ///
    /// The lock is held for the whole fan-out so that concurrent producers
    /// are serialized into one order that every subscriber observes.
    /// Returns the number of subscribers that received the chunk.
    pub fn push(&self, chunk: impl Into<String>) -> usize {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return 0;
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|s| {
            let alive = s.deliver(&chunk);
            if !alive {
                tracing::debug!(subscriber_id = s.id, label = %s.label, "Removed closed subscriber");
            }
            alive
        });
        subscribers.len()
    }

    /// Pushes a rendered notice and mirrors it to the log.
    pub fn push_notice(&self, notice: &Notice) -> usize {
        tracing::info!(notice = %notice, "Notice");
        self.push(notice.to_chunk())
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns statistics for a specific subscriber.
    pub fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.subscribers
            .lock()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbshell_protocol::NoticeKind;

    #[test]
    fn test_fanout_starts_empty() {
        let fanout = OutputFanout::new();
        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(fanout.push("nobody listens"), 0);
    }

    #[test]
    fn test_every_subscriber_sees_every_chunk_in_order() {
        let fanout = OutputFanout::new();
        let mut display = fanout.subscribe("display");
        let mut watcher = fanout.subscribe("watcher");

        for chunk in ["a", "b", "c"] {
            assert_eq!(fanout.push(chunk), 2);
        }

        assert_eq!(display.drain(), vec!["a", "b", "c"]);
        assert_eq!(watcher.drain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_late_subscriber_only_sees_new_chunks() {
        let fanout = OutputFanout::new();
        let mut early = fanout.subscribe("early");
        fanout.push("first");
        let mut late = fanout.subscribe("late");
        fanout.push("second");

        assert_eq!(early.drain(), vec!["first", "second"]);
        assert_eq!(late.drain(), vec!["second"]);
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let fanout = OutputFanout::new();
        let keep = fanout.subscribe("keep");
        let gone = fanout.subscribe("gone");
        drop(gone);

        assert_eq!(fanout.push("x"), 1);
        assert_eq!(fanout.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn test_empty_chunks_are_skipped() {
        let fanout = OutputFanout::new();
        let mut rx = fanout.subscribe("display");
        fanout.push("");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_returns_stats() {
        let fanout = OutputFanout::new();
        let rx = fanout.subscribe("display");
        fanout.push("hello");
        fanout.push("!");

        let stats = fanout.unsubscribe(rx.id()).unwrap();
        assert_eq!(stats.chunks_delivered, 2);
        assert_eq!(stats.bytes_delivered, 6);
        assert!(fanout.unsubscribe(rx.id()).is_none());
    }

    #[test]
    fn test_push_notice_renders_tag() {
        let fanout = OutputFanout::new();
        let mut rx = fanout.subscribe("display");
        fanout.push_notice(&Notice::not_connected());

        let chunk = rx.try_recv().unwrap();
        let notice = Notice::parse(&chunk).unwrap();
        assert_eq!(notice.kind, NoticeKind::Error);
    }

    #[test]
    fn test_concurrent_producers_share_one_order() {
        let fanout = OutputFanout::new();
        let mut a = fanout.subscribe("a");
        let mut b = fanout.subscribe("b");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let fanout = fanout.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        fanout.push(format!("{t}-{i};"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seen_a = a.drain();
        let seen_b = b.drain();
        assert_eq!(seen_a.len(), 400);
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let fanout = OutputFanout::new();
        let mut rx = fanout.subscribe("display");
        let producer = fanout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.push("late chunk");
        });
        assert_eq!(rx.recv().await.as_deref(), Some("late chunk"));
    }
}
