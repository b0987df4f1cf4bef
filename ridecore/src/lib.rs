//! `RideCore` — ride and offer lifecycle engine.
//!
//! This crate coordinates the lifecycle of a ride request from creation
//! through completion or cancellation, and the parallel lifecycle of the
//! driver offers issued against it, with three guarantees that hold under
//! concurrent callers, process crashes and network partitions:
//!
//! - **Race-free transitions.** All mutations go through compare-and-swap
//!   writes in the [`store::LifecycleStore`] port; at most one of any set
//!   of concurrent conflicting writers succeeds.
//! - **Exactly one domain effect, at least one event.** Every committed
//!   transition co-commits exactly one outbox row in the same transaction;
//!   the [`outbox::OutboxPublisher`] delivers rows at-least-once with
//!   bounded backoff and a dead-letter bucket.
//! - **Replay-safe commands.** A client-supplied idempotency key
//!   deduplicates retried commands: the stored response is returned
//!   verbatim and no side effect runs twice.
//!
//! Persistence is pluggable: `ridecore-memory` provides a thread-safe
//! in-memory adapter for tests and development, `ridecore-postgres` a
//! `PostgreSQL` adapter.

pub mod breaker;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod event;
pub mod observer;
pub mod outbox;
pub mod reaper;
pub mod store;
pub mod testing;
pub mod types;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use domain::{Offer, OfferStatus, Ride, RideStatus};
pub use engine::{
    AcceptOffer, AssignDriver, CancelRide, CommandContext, CommandReceipt, CompleteRide,
    CreateOffer, CreateRide, DeclineOffer, ExpireOffer, LifecycleEngine, StartMatching, StartRide,
};
pub use errors::{
    CommandError, CommandResult, DomainError, PublishError, StoreError, StoreResult,
    ValidationError,
};
pub use event::{EventEnvelope, PRODUCER};
pub use observer::{LifecycleObserver, NoopObserver};
pub use outbox::{EventPublisher, OutboxPublisher, PublisherConfig};
pub use reaper::{OfferExpiryReaper, ReaperConfig};
pub use store::{
    IdempotencyRecord, LifecycleStore, OutboxMessage, OutboxStatus, RideTransition,
};
pub use types::{
    DriverId, EventId, GeoPoint, IdempotencyKey, OfferId, RideId, RiderId, Timestamp,
};
