use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    classify::Severity,
    history::ErrorInfo,
    queue::{IngestQueue, QueuedMessage},
    recovery::ErrorRecoveryService,
};

/// Single consumer of the [`IngestQueue`].
pub struct Processor {
    queue: Arc<IngestQueue>,
    recovery: Arc<ErrorRecoveryService>,
    message_ttl: Duration,
    retry_delay: Duration,
}

impl Processor {
    pub fn new(
        config: &courier_config::QueueConfig,
        queue: Arc<IngestQueue>,
        recovery: Arc<ErrorRecoveryService>,
    ) -> Self {
        Self {
            queue,
            recovery,
            message_ttl: config.message_ttl(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Deliver queued messages until cancelled. A dispatch already in
    /// flight when cancellation arrives is allowed to finish.
    pub async fn run(self, cancel: CancellationToken) {
        info!("queue processor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let message = match self.queue.pop() {
                Some(message) => message,
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.queue.notified() => {},
                    }
                    continue;
                },
            };
            let pause = self.process(message).await;
            if !pause.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {},
                }
            }
        }
        info!(pending = self.queue.depth(), "queue processor stopped");
    }

    /// Deliver one message. Returns how long to pause before the next pop.
    pub async fn process(&self, mut message: QueuedMessage) -> Duration {
        let id = message.envelope.id();
        let counters = &self.queue.counters;

        if message.first_enqueued_at.elapsed() > self.message_ttl {
            counters.expired.fetch_add(1, Ordering::Relaxed);
            warn!(
                update_id = id,
                retries = message.retry_count,
                "dropping expired update"
            );
            return Duration::ZERO;
        }

        let err = match self.queue.dispatcher().dispatch(&message.envelope).await {
            Ok(()) => {
                counters.dispatched.fetch_add(1, Ordering::Relaxed);
                debug!(update_id = id, priority = ?message.priority, "update dispatched");
                return Duration::ZERO;
            },
            Err(e) => e,
        };

        message.retry_count += 1;
        let (classification, wait) = self.recovery.remediate(&err, message.retry_count);

        if message.retry_count >= message.max_retries {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                update_id = id,
                attempts = message.retry_count,
                kind = %classification.kind,
                error = %err,
                "dispatch retries exhausted, dropping update"
            );
            self.queue.history().record(
                ErrorInfo::new(
                    "dispatchFailed",
                    Severity::High,
                    format!("update {id}: {err:#}"),
                )
                .with_retries(message.retry_count, message.max_retries)
                .with_strategy(classification.kind),
            );
            return self.retry_delay;
        }

        counters.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            update_id = id,
            attempt = message.retry_count,
            max_retries = message.max_retries,
            kind = %classification.kind,
            error = %err,
            "dispatch failed, re-queueing update"
        );
        self.queue.requeue(message);
        self.retry_delay + wait
    }
}
