//! Test doubles for the broker and observer ports.
//!
//! These are used by the crate's own integration tests and are exported
//! for downstream crates that want to exercise the engine without a real
//! broker or metrics pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{CommandError, PublishError};
use crate::observer::LifecycleObserver;
use crate::outbox::EventPublisher;

/// A broker double that records every delivered message.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    delivered: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the (topic, payload) pairs delivered so far.
    pub fn delivered(&self) -> Vec<(String, serde_json::Value)> {
        self.delivered.lock().expect("mutex poisoned").clone()
    }

    /// Returns the topics delivered so far, in order.
    pub fn topics(&self) -> Vec<String> {
        self.delivered
            .lock()
            .expect("mutex poisoned")
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), PublishError> {
        self.delivered
            .lock()
            .expect("mutex poisoned")
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

/// A broker double that fails the first `failures` deliveries, then
/// succeeds.
///
/// With `failures` set to `u64::MAX` the publisher never succeeds, which
/// is how dead-letter behavior is driven in tests.
#[derive(Debug)]
pub struct FailingPublisher {
    failures: u64,
    attempts: AtomicU64,
}

impl FailingPublisher {
    /// Fails the first `failures` deliveries.
    pub fn failing(failures: u64) -> Self {
        Self {
            failures,
            attempts: AtomicU64::new(0),
        }
    }

    /// Never succeeds.
    pub fn always_failing() -> Self {
        Self::failing(u64::MAX)
    }

    /// Returns how many deliveries were attempted.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(
        &self,
        _topic: &str,
        _payload: &serde_json::Value,
    ) -> Result<(), PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        if attempt < self.failures {
            Err(PublishError::Unavailable("broker offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// An observer that counts every signal.
#[derive(Debug, Default)]
pub struct CountingObserver {
    /// Commands that committed a transition.
    pub applied: AtomicU64,
    /// Keyed commands answered from their stored response.
    pub replayed: AtomicU64,
    /// Commands that failed.
    pub rejected: AtomicU64,
    /// Messages delivered to the broker.
    pub published: AtomicU64,
    /// Redeliveries scheduled.
    pub retried: AtomicU64,
    /// Messages dead-lettered.
    pub dead: AtomicU64,
    /// Offers expired by the reaper.
    pub expired: AtomicU64,
    /// Offers the reaper skipped because they settled concurrently.
    pub sweep_skipped: AtomicU64,
}

impl CountingObserver {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LifecycleObserver for CountingObserver {
    fn command_applied(&self, _verb: &'static str) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    fn command_replayed(&self, _verb: &'static str) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    fn command_rejected(&self, _verb: &'static str, _error: &CommandError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn message_published(&self, _topic: &str) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn message_retried(&self, _topic: &str, _attempts: u32) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dead(&self, _topic: &str) {
        self.dead.fetch_add(1, Ordering::Relaxed);
    }

    fn offer_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn offer_sweep_skipped(&self) {
        self.sweep_skipped.fetch_add(1, Ordering::Relaxed);
    }
}
