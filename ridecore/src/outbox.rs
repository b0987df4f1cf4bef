//! Outbox publication: the broker port and the publisher worker.
//!
//! The command path never talks to the broker; it only writes PENDING
//! outbox rows inside its own transaction. The [`OutboxPublisher`] runs on
//! an independent timer, claims due rows, delivers them and advances each
//! row's lifecycle:
//!
//! - delivery succeeded → SENT
//! - delivery failed, attempts remain → back to PENDING with
//!   `next_attempt_at = now + min(2^attempts, 2^6)` seconds
//! - delivery failed, budget exhausted → DEAD, awaiting operator replay
//!
//! Delivery is at-least-once: a crash between broker acknowledgment and
//! the SENT write causes a duplicate publish after restart, and claims are
//! time-boxed so a crashed worker's rows become claimable again. Consumers
//! deduplicate by event identifier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{PublishError, StoreResult};
use crate::observer::LifecycleObserver;
use crate::store::{LifecycleStore, OutboxMessage};
use crate::types::Timestamp;

/// Port to the durable broker.
///
/// Implementations only need to report success or failure; retry, backoff
/// and dead-lettering are the worker's concern.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers one payload to the given topic.
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), PublishError>;
}

/// Configuration for the outbox publisher worker.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How often the worker polls for due rows.
    pub poll_interval: Duration,
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    /// Delivery attempts before a row is dead-lettered.
    pub max_attempts: u32,
    /// Age after which a CLAIMED row is considered abandoned and released
    /// back to PENDING on worker startup.
    pub claim_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_attempts: 8,
            claim_timeout: Duration::from_secs(300),
        }
    }
}

/// Redelivery delay after `attempts` failed deliveries.
///
/// Exponential in whole seconds, capped at six doublings (64 seconds).
pub fn redelivery_delay(attempts: u32) -> chrono::Duration {
    const MAX_DOUBLINGS: u32 = 6;
    chrono::Duration::seconds(i64::from(1_u32 << attempts.min(MAX_DOUBLINGS)))
}

/// Background worker that drains the outbox to the broker.
///
/// The worker is driven by [`start`](Self::start)/[`stop`](Self::stop) for
/// production use; [`drain_at`](Self::drain_at) processes a single claim
/// batch against a caller-supplied clock, which embedding code and tests
/// use for deterministic scheduling.
pub struct OutboxPublisher<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: PublisherConfig,
    observer: Arc<dyn LifecycleObserver>,
    is_running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S, P> OutboxPublisher<S, P>
where
    S: LifecycleStore + 'static,
    P: EventPublisher + 'static,
{
    /// Creates a worker over the given store and broker port.
    pub fn new(
        store: Arc<S>,
        publisher: Arc<P>,
        config: PublisherConfig,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            observer,
            is_running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    /// Starts the polling loop.
    ///
    /// Releases stale claims first so rows stranded by a previous crash
    /// become deliverable again. Calling `start` on a running worker is a
    /// logged no-op.
    pub async fn start(&self) -> StoreResult<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            warn!("outbox publisher already running");
            return Ok(());
        }

        let stale_cutoff = Timestamp::now().advanced_by(
            -chrono::Duration::from_std(self.config.claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        );
        let released = match self.store.release_stale_claims(stale_cutoff).await {
            Ok(released) => released,
            Err(error) => {
                self.is_running.store(false, Ordering::Release);
                return Err(error);
            }
        };
        if released > 0 {
            info!(released, "released stale outbox claims");
            self.observer.claims_released(released);
        }

        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let config = self.config.clone();
        let observer = Arc::clone(&self.observer);
        let is_running = Arc::clone(&self.is_running);

        let task = tokio::spawn(async move {
            let mut ticker = interval(config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while is_running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !is_running.load(Ordering::Acquire) {
                    break;
                }
                match Self::drain(&store, &publisher, &config, &observer, Timestamp::now()).await {
                    Ok(0) => {}
                    Ok(drained) => debug!(drained, "outbox batch drained"),
                    Err(error) => warn!(%error, "outbox drain failed; will retry next tick"),
                }
            }
            debug!("outbox publisher loop exited");
        });

        *self.task_handle.lock().await = Some(task);
        info!("outbox publisher started");
        Ok(())
    }

    /// Stops the polling loop.
    ///
    /// An in-flight batch may be abandoned mid-claim; the affected rows
    /// are released by the stale-claim sweep on the next start.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            warn!("outbox publisher already stopped");
            return;
        }
        if let Some(task) = self.task_handle.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("outbox publisher stopped");
    }

    /// Claims and processes one batch of rows due at `now`.
    ///
    /// Returns the number of rows claimed. This is the loop body of the
    /// background task, exposed for embedding and deterministic tests.
    pub async fn drain_at(&self, now: Timestamp) -> StoreResult<usize> {
        Self::drain(&self.store, &self.publisher, &self.config, &self.observer, now).await
    }

    #[instrument(skip_all, fields(batch = config.batch_size))]
    async fn drain(
        store: &Arc<S>,
        publisher: &Arc<P>,
        config: &PublisherConfig,
        observer: &Arc<dyn LifecycleObserver>,
        now: Timestamp,
    ) -> StoreResult<usize> {
        let claimed = store.claim_due_messages(config.batch_size, now).await?;
        let count = claimed.len();

        for message in claimed {
            Self::deliver(store, publisher, config, observer, message, now).await?;
        }
        Ok(count)
    }

    async fn deliver(
        store: &Arc<S>,
        publisher: &Arc<P>,
        config: &PublisherConfig,
        observer: &Arc<dyn LifecycleObserver>,
        message: OutboxMessage,
        now: Timestamp,
    ) -> StoreResult<()> {
        match publisher.publish(&message.topic, &message.payload).await {
            Ok(()) => {
                store.mark_sent(message.id).await?;
                observer.message_published(&message.topic);
                Ok(())
            }
            Err(publish_error) => {
                let attempts = message.attempts + 1;
                if attempts < config.max_attempts {
                    let next_attempt_at = now.advanced_by(redelivery_delay(attempts));
                    warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        attempts,
                        %next_attempt_at,
                        %publish_error,
                        "delivery failed; redelivery scheduled"
                    );
                    store
                        .schedule_redelivery(
                            message.id,
                            attempts,
                            next_attempt_at,
                            &publish_error.to_string(),
                        )
                        .await?;
                    observer.message_retried(&message.topic, attempts);
                } else {
                    error!(
                        message_id = %message.id,
                        topic = %message.topic,
                        attempts,
                        %publish_error,
                        "delivery attempts exhausted; dead-lettering message"
                    );
                    store
                        .mark_dead(message.id, &publish_error.to_string())
                        .await?;
                    observer.message_dead(&message.topic);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_delay_doubles_then_caps() {
        assert_eq!(redelivery_delay(0), chrono::Duration::seconds(1));
        assert_eq!(redelivery_delay(1), chrono::Duration::seconds(2));
        assert_eq!(redelivery_delay(3), chrono::Duration::seconds(8));
        assert_eq!(redelivery_delay(6), chrono::Duration::seconds(64));
        assert_eq!(redelivery_delay(7), chrono::Duration::seconds(64));
        assert_eq!(redelivery_delay(40), chrono::Duration::seconds(64));
    }

    #[test]
    fn redelivery_delays_are_non_decreasing() {
        let mut previous = chrono::Duration::zero();
        for attempt in 0..12 {
            let delay = redelivery_delay(attempt);
            assert!(delay >= previous, "attempt {attempt}");
            previous = delay;
        }
    }
}
