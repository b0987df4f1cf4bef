//! Background sweep that expires overdue offers.
//!
//! The reaper does not touch storage directly: each overdue offer goes
//! through the normal [`expire_offer`](crate::engine::LifecycleEngine::expire_offer)
//! command path, with no idempotency key, so an expiry event is emitted
//! with the same transactional durability as any client-triggered
//! transition. If an offer was accepted or declined between the scan and
//! the write, the compare-and-swap fails harmlessly and the reaper logs
//! and moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::engine::{CommandContext, ExpireOffer, LifecycleEngine};
use crate::errors::{CommandError, StoreResult};
use crate::observer::LifecycleObserver;
use crate::store::LifecycleStore;
use crate::types::Timestamp;

/// Configuration for the offer expiry reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often the reaper scans for overdue offers.
    pub poll_interval: Duration,
    /// Maximum offers expired per sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Background worker that expires PENDING offers past their expiry instant.
pub struct OfferExpiryReaper<S> {
    engine: Arc<LifecycleEngine<S>>,
    store: Arc<S>,
    config: ReaperConfig,
    observer: Arc<dyn LifecycleObserver>,
    is_running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S> OfferExpiryReaper<S>
where
    S: LifecycleStore + 'static,
{
    /// Creates a reaper sweeping `store` through `engine`.
    pub fn new(
        engine: Arc<LifecycleEngine<S>>,
        store: Arc<S>,
        config: ReaperConfig,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        Self {
            engine,
            store,
            config,
            observer,
            is_running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    /// Starts the sweep loop. Calling `start` on a running reaper is a
    /// logged no-op.
    pub async fn start(&self) {
        if self.is_running.swap(true, Ordering::AcqRel) {
            warn!("offer expiry reaper already running");
            return;
        }

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
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
                match Self::sweep(&engine, &store, &config, &observer, Timestamp::now()).await {
                    Ok(0) => {}
                    Ok(expired) => debug!(expired, "expired overdue offers"),
                    Err(error) => warn!(%error, "offer sweep failed; will retry next tick"),
                }
            }
            debug!("offer expiry reaper loop exited");
        });

        *self.task_handle.lock().await = Some(task);
        info!("offer expiry reaper started");
    }

    /// Stops the sweep loop.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            warn!("offer expiry reaper already stopped");
            return;
        }
        if let Some(task) = self.task_handle.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("offer expiry reaper stopped");
    }

    /// Runs one sweep against a caller-supplied clock.
    ///
    /// Returns the number of offers actually expired. This is the loop
    /// body of the background task, exposed for embedding and
    /// deterministic tests.
    pub async fn sweep_at(&self, now: Timestamp) -> StoreResult<usize> {
        Self::sweep(&self.engine, &self.store, &self.config, &self.observer, now).await
    }

    #[instrument(skip_all, fields(batch = config.batch_size))]
    async fn sweep(
        engine: &Arc<LifecycleEngine<S>>,
        store: &Arc<S>,
        config: &ReaperConfig,
        observer: &Arc<dyn LifecycleObserver>,
        now: Timestamp,
    ) -> StoreResult<usize> {
        let overdue = store.expired_pending_offers(now, config.batch_size).await?;
        let mut expired = 0;

        for offer in overdue {
            let command = ExpireOffer { offer_id: offer.id };
            match engine.expire_offer(command, CommandContext::default()).await {
                Ok(_) => {
                    expired += 1;
                    observer.offer_expired();
                }
                // The offer was settled between the scan and the write;
                // someone else's transition stands.
                Err(
                    CommandError::Conflict(_)
                    | CommandError::InvalidTransition(_)
                    | CommandError::OfferNotFound(_),
                ) => {
                    debug!(offer_id = %offer.id, "offer settled before expiry sweep reached it");
                    observer.offer_sweep_skipped();
                }
                Err(error) => {
                    warn!(offer_id = %offer.id, %error, "failed to expire offer");
                }
            }
        }
        Ok(expired)
    }
}
