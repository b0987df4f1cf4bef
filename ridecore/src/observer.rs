//! Observer port for engine metrics.
//!
//! The engine and its background workers report outcome counts through
//! this trait instead of a process-wide registry: each engine instance
//! owns its observer, injected at construction. The default implementation
//! ignores everything, so wiring an observer is strictly opt-in.

use crate::errors::CommandError;

/// Receives per-outcome increments from the engine and its workers.
///
/// All methods have no-op defaults; implementors override the counters
/// they care about. Implementations must be cheap and non-blocking — they
/// run on the command path.
pub trait LifecycleObserver: Send + Sync {
    /// A command committed a transition.
    fn command_applied(&self, _verb: &'static str) {}

    /// A keyed command was answered from its stored response.
    fn command_replayed(&self, _verb: &'static str) {}

    /// A command failed; the error carries the outcome category.
    fn command_rejected(&self, _verb: &'static str, _error: &CommandError) {}

    /// The publisher delivered a message to the broker.
    fn message_published(&self, _topic: &str) {}

    /// The publisher scheduled a redelivery after a failed attempt.
    fn message_retried(&self, _topic: &str, _attempts: u32) {}

    /// The publisher dead-lettered a message.
    fn message_dead(&self, _topic: &str) {}

    /// The publisher returned stale claims to the pending pool.
    fn claims_released(&self, _count: u64) {}

    /// The reaper expired an overdue offer.
    fn offer_expired(&self) {}

    /// The reaper skipped an offer that was settled concurrently.
    fn offer_sweep_skipped(&self) {}
}

/// An observer that ignores every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LifecycleObserver for NoopObserver {}
