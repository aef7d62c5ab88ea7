use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    serde::Serialize,
    tokio::sync::Notify,
    tracing::{debug, error, warn},
};

use crate::{
    classify::{Severity, classify},
    dedup::DedupSet,
    envelope::{Dispatch, Envelope},
    error::{Error, Result},
    history::{ErrorHistory, ErrorInfo},
};

/// Delivery priority; lower value is delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Administrative and emergency commands.
    Critical = 1,
    /// Ordinary user messages.
    Normal = 2,
    /// UI callback events.
    Callback = 3,
    Low = 4,
}

impl Priority {
    #[must_use]
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Content inspection supplied by the application layer.
pub trait EnvelopeClassifier: Send + Sync {
    fn priority(&self, envelope: &Envelope) -> Priority;

    /// Critical envelopes are dispatched inline when the queue is full.
    fn is_critical(&self, envelope: &Envelope) -> bool;
}

/// An envelope waiting for delivery.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Refreshed on every re-enqueue.
    pub enqueued_at: Instant,
    /// Set once, when the envelope first entered the queue.
    pub first_enqueued_at: Instant,
}

/// Result of a successful [`IngestQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued(Priority),
    /// Queue was full; the critical envelope was dispatched immediately.
    DispatchedInline,
}

/// Monotonic counters exposed on the status endpoint.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub enqueued: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub dispatched: AtomicU64,
    pub dispatched_inline: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub expired: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub max_size: usize,
    pub dedup_entries: usize,
    pub enqueued: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub dispatched_inline: u64,
    pub retried: u64,
    pub dropped: u64,
    pub expired: u64,
}

/// Ordering key: priority class first, then arrival sequence.
type SlotKey = (Priority, u64);

struct QueueInner {
    pending: BTreeMap<SlotKey, QueuedMessage>,
    seen: DedupSet,
    next_seq: u64,
}

impl QueueInner {
    fn push(&mut self, message: QueuedMessage) {
        let key = (message.priority, self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, message);
    }
}

/// Bounded priority queue with deduplication.
///
/// The pending map and the dedup set share one mutex, which is never held
/// across an `.await`.
pub struct IngestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_size: usize,
    max_retries: u32,
    classifier: Arc<dyn EnvelopeClassifier>,
    dispatch: Arc<dyn Dispatch>,
    history: Arc<ErrorHistory>,
    pub(crate) counters: Counters,
}

impl IngestQueue {
    pub fn new(
        config: &courier_config::QueueConfig,
        classifier: Arc<dyn EnvelopeClassifier>,
        dispatch: Arc<dyn Dispatch>,
        history: Arc<ErrorHistory>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: BTreeMap::new(),
                seen: DedupSet::new(config.dedup_capacity, config.dedup_retain),
                next_seq: 0,
            }),
            notify: Notify::new(),
            max_size: config.max_size,
            max_retries: config.max_retries,
            classifier,
            dispatch,
            history,
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept an envelope for delivery.
    ///
    /// Fails with [`Error::Duplicate`] for an id already seen and
    /// [`Error::QueueFull`] when at capacity, unless the envelope is
    /// critical, in which case it is dispatched before returning.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<Enqueued> {
        let id = envelope.id();
        {
            let mut inner = self.lock();
            if inner.seen.contains(id) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(update_id = id, "ignoring duplicate update");
                return Err(Error::Duplicate { id });
            }

            let depth = inner.pending.len();
            if depth < self.max_size {
                let priority = self.classifier.priority(&envelope);
                let now = Instant::now();
                inner.seen.insert(id);
                inner.push(QueuedMessage {
                    envelope,
                    priority,
                    retry_count: 0,
                    max_retries: self.max_retries,
                    enqueued_at: now,
                    first_enqueued_at: now,
                });
                drop(inner);
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                debug!(update_id = id, ?priority, "update queued");
                return Ok(Enqueued::Queued(priority));
            }

            if !self.classifier.is_critical(&envelope) {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(update_id = id, depth, "queue full, rejecting update");
                return Err(Error::QueueFull { depth });
            }
            // Reserved while the inline dispatch runs; released if it fails.
            inner.seen.insert(id);
        }

        warn!(update_id = id, "queue full, dispatching critical update inline");
        match self.dispatch.dispatch(&envelope).await {
            Ok(()) => {
                self.counters.dispatched_inline.fetch_add(1, Ordering::Relaxed);
                Ok(Enqueued::DispatchedInline)
            },
            Err(e) => {
                self.lock().seen.remove(id);
                let c = classify(&e);
                error!(update_id = id, error = %e, "inline dispatch of critical update failed");
                self.history.record(
                    ErrorInfo::new("dispatchFailed", Severity::High, format!("{e:#}"))
                        .with_retries(1, 1)
                        .with_strategy(c.kind),
                );
                Err(Error::DispatchFailed { id, attempts: 1 })
            },
        }
    }

    /// Put a failed message back at the tail of its priority class.
    pub(crate) fn requeue(&self, mut message: QueuedMessage) {
        message.enqueued_at = Instant::now();
        self.lock().push(message);
        self.notify.notify_one();
    }

    /// Remove the next message in `(priority, arrival)` order.
    pub fn pop(&self) -> Option<QueuedMessage> {
        self.lock().pending.pop_first().map(|(_, message)| message)
    }

    /// Wait until something is enqueued. A notification sent while nobody
    /// was waiting is kept, so wakeups are not lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn Dispatch> {
        &self.dispatch
    }

    pub(crate) fn history(&self) -> &Arc<ErrorHistory> {
        &self.history
    }

    #[must_use]
    pub fn is_critical(&self, envelope: &Envelope) -> bool {
        self.classifier.is_critical(envelope)
    }

    /// Shrink the dedup set to its retain target and release spare map
    /// capacity. Returns the number of ids forgotten.
    pub fn release_memory(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.seen.len();
        let keep = inner.seen.retain_target();
        inner.seen.trim_to(keep);
        before - inner.seen.len()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let (depth, dedup_entries) = {
            let inner = self.lock();
            (inner.pending.len(), inner.seen.len())
        };
        let c = &self.counters;
        QueueStats {
            depth,
            max_size: self.max_size,
            dedup_entries,
            enqueued: c.enqueued.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dispatched_inline: c.dispatched_inline.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {super::*, async_trait::async_trait, serde_json::json};

    /// Reads `priority` (1-4) and `critical` straight from the payload.
    pub struct PayloadClassifier;

    impl EnvelopeClassifier for PayloadClassifier {
        fn priority(&self, envelope: &Envelope) -> Priority {
            match envelope.payload()["priority"].as_u64() {
                Some(1) => Priority::Critical,
                Some(2) => Priority::Normal,
                Some(3) => Priority::Callback,
                _ => Priority::Low,
            }
        }

        fn is_critical(&self, envelope: &Envelope) -> bool {
            envelope.payload()["critical"].as_bool().unwrap_or(false)
        }
    }

    /// Records every dispatched id; fails when `fail` is set.
    #[derive(Default)]
    pub struct RecordingDispatch {
        pub seen: Mutex<Vec<i64>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Dispatch for RecordingDispatch {
        async fn dispatch(&self, envelope: &Envelope) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(envelope.id());
            if self.fail {
                anyhow::bail!("handler crashed");
            }
            Ok(())
        }
    }

    pub fn envelope(id: i64, priority: u64) -> Envelope {
        Envelope::new(id, json!({ "update_id": id, "priority": priority }))
    }

    pub fn queue_with(max_size: usize, dispatch: Arc<RecordingDispatch>) -> IngestQueue {
        let config = courier_config::QueueConfig {
            max_size,
            ..Default::default()
        };
        IngestQueue::new(
            &config,
            Arc::new(PayloadClassifier),
            dispatch,
            Arc::new(ErrorHistory::new(100)),
        )
    }

    #[tokio::test]
    async fn same_id_is_queued_once() {
        let queue = queue_with(10, Arc::default());
        queue.enqueue(envelope(7, 2)).await.unwrap();
        let second = queue.enqueue(envelope(7, 2)).await;
        assert!(matches!(second, Err(Error::Duplicate { id: 7 })));
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn pops_by_priority_then_arrival() {
        let queue = queue_with(10, Arc::default());
        for (id, priority) in [(1, 4), (2, 1), (3, 3), (4, 1), (5, 2)] {
            queue.enqueue(envelope(id, priority)).await.unwrap();
        }
        let order: Vec<(i64, u8)> = std::iter::from_fn(|| queue.pop())
            .map(|m| (m.envelope.id(), m.priority.rank()))
            .collect();
        assert_eq!(order, vec![(2, 1), (4, 1), (5, 2), (3, 3), (1, 4)]);
    }

    #[tokio::test]
    async fn requeue_goes_behind_same_class() {
        let queue = queue_with(10, Arc::default());
        queue.enqueue(envelope(1, 2)).await.unwrap();
        queue.enqueue(envelope(2, 2)).await.unwrap();
        let head = queue.pop().unwrap();
        queue.requeue(head);
        assert_eq!(queue.pop().unwrap().envelope.id(), 2);
        assert_eq!(queue.pop().unwrap().envelope.id(), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_non_critical() {
        let dispatch = Arc::new(RecordingDispatch::default());
        let queue = queue_with(2, Arc::clone(&dispatch));
        queue.enqueue(envelope(1, 2)).await.unwrap();
        queue.enqueue(envelope(2, 2)).await.unwrap();

        let result = queue.enqueue(envelope(3, 2)).await;
        assert!(matches!(result, Err(Error::QueueFull { depth: 2 })));
        assert_eq!(queue.depth(), 2);
        assert!(dispatch.seen.lock().unwrap().is_empty());

        // A rejected id is not remembered, so redelivery can succeed later.
        queue.pop();
        assert!(queue.enqueue(envelope(3, 2)).await.is_ok());
    }

    #[tokio::test]
    async fn full_queue_dispatches_critical_inline() {
        let dispatch = Arc::new(RecordingDispatch::default());
        let queue = queue_with(1, Arc::clone(&dispatch));
        queue.enqueue(envelope(1, 2)).await.unwrap();

        let critical = Envelope::new(9, json!({ "update_id": 9, "critical": true }));
        let result = queue.enqueue(critical.clone()).await.unwrap();
        assert_eq!(result, Enqueued::DispatchedInline);
        assert_eq!(queue.depth(), 1);
        assert_eq!(*dispatch.seen.lock().unwrap(), vec![9]);

        // Delivered inline, so a redelivery is a duplicate.
        assert!(matches!(
            queue.enqueue(critical).await,
            Err(Error::Duplicate { id: 9 })
        ));
    }

    #[tokio::test]
    async fn failed_inline_dispatch_is_recorded() {
        let dispatch = Arc::new(RecordingDispatch {
            fail: true,
            ..Default::default()
        });
        let queue = queue_with(0, Arc::clone(&dispatch));
        let critical = Envelope::new(5, json!({ "update_id": 5, "critical": true }));
        let result = queue.enqueue(critical).await;
        assert!(matches!(result, Err(Error::DispatchFailed { id: 5, .. })));
        assert_eq!(queue.history().recent(1)[0].severity, Severity::High);

        // Not remembered, so the platform's redelivery is tried again.
        let retry = Envelope::new(5, json!({ "update_id": 5, "critical": true }));
        assert!(matches!(
            queue.enqueue(retry).await,
            Err(Error::DispatchFailed { id: 5, .. })
        ));
        assert_eq!(*dispatch.seen.lock().unwrap(), vec![5, 5]);
    }

    /// Blocks every dispatch until `gate` is notified.
    #[derive(Default)]
    struct GatedDispatch {
        gate: Notify,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Dispatch for GatedDispatch {
        async fn dispatch(&self, _: &Envelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_critical_redelivery_dispatches_once() {
        let dispatch = Arc::new(GatedDispatch::default());
        let queue = IngestQueue::new(
            &courier_config::QueueConfig {
                max_size: 0,
                ..Default::default()
            },
            Arc::new(PayloadClassifier),
            Arc::clone(&dispatch) as Arc<dyn Dispatch>,
            Arc::new(ErrorHistory::new(10)),
        );
        let critical = Envelope::new(11, json!({ "update_id": 11, "critical": true }));

        let (first, second, ()) = tokio::join!(
            queue.enqueue(critical.clone()),
            queue.enqueue(critical.clone()),
            async { dispatch.gate.notify_one() },
        );
        assert_eq!(first.unwrap(), Enqueued::DispatchedInline);
        assert!(matches!(second, Err(Error::Duplicate { id: 11 })));
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_set_stays_bounded() {
        let queue = queue_with(2000, Arc::default());
        for id in 0..1500 {
            queue.enqueue(envelope(id, 4)).await.unwrap();
        }
        assert!(queue.stats().dedup_entries <= 1000);
        for id in 1000..1500 {
            assert!(matches!(
                queue.enqueue(envelope(id, 4)).await,
                Err(Error::Duplicate { .. })
            ));
        }
    }

    #[tokio::test]
    async fn release_memory_trims_to_retain_target() {
        let config = courier_config::QueueConfig {
            dedup_capacity: 10,
            dedup_retain: 3,
            ..Default::default()
        };
        let queue = IngestQueue::new(
            &config,
            Arc::new(PayloadClassifier),
            Arc::new(RecordingDispatch::default()),
            Arc::new(ErrorHistory::new(10)),
        );
        for id in 0..8 {
            queue.enqueue(envelope(id, 4)).await.unwrap();
        }
        assert_eq!(queue.release_memory(), 5);
        assert_eq!(queue.stats().dedup_entries, 3);
        assert!(matches!(
            queue.enqueue(envelope(7, 4)).await,
            Err(Error::Duplicate { id: 7 })
        ));
    }
}
