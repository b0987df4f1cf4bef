//! The lifecycle store port.
//!
//! This module defines the [`LifecycleStore`] trait that every persistence
//! adapter implements. The trait is designed around two rules the engine
//! cannot function without:
//!
//! 1. **Compare-and-swap writes.** Status updates are conditional on the
//!    status the caller observed; the adapter must apply the condition
//!    atomically at the storage layer so that at most one of any set of
//!    concurrent conflicting writers succeeds.
//! 2. **Co-committed side records.** Every mutating operation takes the
//!    event envelope for the transition and an optional idempotency record,
//!    and must persist aggregate change, outbox row and record in one
//!    transaction. A crash can therefore never separate a committed state
//!    change from its event, nor a committed effect from its replay
//!    snapshot.
//!
//! The store is the single source of truth: no in-memory cache of ride or
//! offer status may be treated as authoritative.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Offer, OfferStatus, Ride, RideStatus};
use crate::errors::{StoreError, StoreResult};
use crate::event::EventEnvelope;
use crate::types::{DriverId, EventId, IdempotencyKey, OfferId, RideId, Timestamp};

/// Delivery lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting delivery (or redelivery once `next_attempt_at` passes).
    Pending,
    /// Cooperatively claimed by a publisher worker. Claims are time-boxed:
    /// a worker crash leaves the row claimable again after the claim
    /// timeout.
    Claimed,
    /// Acknowledged by the broker. Terminal; removed later by retention
    /// cleanup.
    Sent,
    /// Retry budget exhausted. Terminal until an operator replays it.
    Dead,
}

impl OutboxStatus {
    /// Returns the canonical wire representation of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Sent => "SENT",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CLAIMED" => Ok(Self::Claimed),
            "SENT" => Ok(Self::Sent),
            "DEAD" => Ok(Self::Dead),
            other => Err(format!("unknown outbox status '{other}'")),
        }
    }
}

/// A durable outbox row.
///
/// Rows are created in the same transaction as the domain mutation that
/// produced them and mutated only by the publisher worker (plus the
/// operator-triggered dead-letter replay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Row identifier; equal to the envelope's event identifier so that
    /// downstream consumers can deduplicate redeliveries.
    pub id: EventId,
    /// Destination topic; equal to the envelope's event type.
    pub topic: String,
    /// The serialized [`EventEnvelope`].
    pub payload: serde_json::Value,
    /// Delivery lifecycle status.
    pub status: OutboxStatus,
    /// Number of delivery attempts so far.
    pub attempts: u32,
    /// Earliest instant the row may next be claimed.
    pub next_attempt_at: Timestamp,
    /// When the row was claimed, while status is [`OutboxStatus::Claimed`].
    pub claimed_at: Option<Timestamp>,
    /// Error text of the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the row was written.
    pub created_at: Timestamp,
}

impl OutboxMessage {
    /// Builds the pending row for an envelope, due immediately.
    pub fn pending(envelope: &EventEnvelope, now: Timestamp) -> StoreResult<Self> {
        let payload = serde_json::to_value(envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: envelope.event_id,
            topic: envelope.event_type.clone(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            claimed_at: None,
            last_error: None,
            created_at: now,
        })
    }
}

/// The stored snapshot of a keyed command's response.
///
/// Written only inside successful transition commits; read-only afterwards
/// until a retention sweep purges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The client-supplied deduplication key.
    pub key: IdempotencyKey,
    /// The serialized response returned to the first caller.
    pub response: serde_json::Value,
    /// When the record was written.
    pub created_at: Timestamp,
}

/// A conditional ride status update co-committed with an offer insert.
///
/// Creating a ride's first offer also moves the ride MATCHING → OFFERED;
/// both must land in the same transaction or neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideTransition {
    /// The ride being moved.
    pub ride_id: RideId,
    /// The status the caller observed.
    pub expected: RideStatus,
    /// The status to move to.
    pub next: RideStatus,
    /// The new `updated_at` value.
    pub updated_at: Timestamp,
}

/// Port trait for the transactional lifecycle store.
///
/// Adapters implement every operation with the atomicity notes on each
/// method; the engine and the background workers are written against this
/// trait only.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Loads a ride, failing with [`StoreError::RideNotFound`] if absent.
    async fn fetch_ride(&self, id: RideId) -> StoreResult<Ride>;

    /// Loads an offer, failing with [`StoreError::OfferNotFound`] if absent.
    async fn fetch_offer(&self, id: OfferId) -> StoreResult<Offer>;

    /// Inserts a new ride, its outbox row and the optional idempotency
    /// record in one transaction.
    async fn insert_ride(
        &self,
        ride: &Ride,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()>;

    /// Conditionally moves a ride to `next`, provided its stored status
    /// still equals `expected` at write time.
    ///
    /// The stored driver column is derived from
    /// [`RideStatus::requires_driver`] for `next`, which clears the driver
    /// when a driver-assigned ride is cancelled. The outbox row and the
    /// optional idempotency record commit in the same transaction. The
    /// loser of a concurrent race gets [`StoreError::RideConflict`] and
    /// nothing is written.
    async fn update_ride_status_if_current(
        &self,
        id: RideId,
        expected: RideStatus,
        next: RideStatus,
        updated_at: Timestamp,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Ride>;

    /// Conditionally moves a ride to [`RideStatus::DriverAssigned`] and
    /// sets the driver, with the same compare-and-swap and co-commit
    /// semantics as
    /// [`update_ride_status_if_current`](Self::update_ride_status_if_current).
    async fn assign_driver_if_current(
        &self,
        id: RideId,
        expected: RideStatus,
        driver_id: DriverId,
        updated_at: Timestamp,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Ride>;

    /// Inserts a new offer, optionally co-committing the ride's
    /// MATCHING → OFFERED transition, plus outbox row and idempotency
    /// record — all in one transaction.
    ///
    /// Fails with [`StoreError::DuplicateOffer`] when a PENDING offer for
    /// the same (ride, driver) pair already exists; the adapter must make
    /// this check atomic with the insert.
    async fn insert_offer(
        &self,
        offer: &Offer,
        ride_transition: Option<&RideTransition>,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()>;

    /// Conditionally moves an offer to `next`, provided its stored status
    /// still equals `expected` at write time; co-commits the outbox row
    /// and optional idempotency record. The loser of a race gets
    /// [`StoreError::OfferConflict`].
    async fn update_offer_status_if_current(
        &self,
        id: OfferId,
        expected: OfferStatus,
        next: OfferStatus,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Offer>;

    /// Looks up the stored response snapshot for a deduplication key.
    async fn fetch_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Atomically claims up to `batch` PENDING rows whose
    /// `next_attempt_at` has passed, marking them CLAIMED and returning
    /// them oldest-due first.
    ///
    /// The claim must be a single atomic read-and-mark so that concurrent
    /// publisher replicas never double-claim a row.
    async fn claim_due_messages(
        &self,
        batch: usize,
        now: Timestamp,
    ) -> StoreResult<Vec<OutboxMessage>>;

    /// Marks a claimed row as delivered.
    async fn mark_sent(&self, id: EventId) -> StoreResult<()>;

    /// Returns a claimed row to PENDING for a later redelivery attempt.
    async fn schedule_redelivery(
        &self,
        id: EventId,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> StoreResult<()>;

    /// Dead-letters a claimed row whose retry budget is exhausted.
    async fn mark_dead(&self, id: EventId, error: &str) -> StoreResult<()>;

    /// Returns CLAIMED rows older than `older_than` to PENDING.
    ///
    /// Called by the publisher on startup so that rows claimed by a
    /// crashed worker become deliverable again. Returns how many rows were
    /// released.
    async fn release_stale_claims(&self, older_than: Timestamp) -> StoreResult<u64>;

    /// Resets up to `limit` DEAD rows back to PENDING with a fresh attempt
    /// budget. This operator-triggered replay is the only mutation of
    /// outbox state outside the publisher worker. Returns how many rows
    /// were reset.
    async fn replay_dead_messages(&self, limit: usize) -> StoreResult<u64>;

    /// Counts outbox rows in the given status.
    async fn count_outbox(&self, status: OutboxStatus) -> StoreResult<u64>;

    /// Loads a single outbox row for inspection.
    async fn outbox_message(&self, id: EventId) -> StoreResult<OutboxMessage>;

    /// Lists PENDING offers whose expiry instant has passed, oldest expiry
    /// first, bounded by `batch`.
    async fn expired_pending_offers(
        &self,
        now: Timestamp,
        batch: usize,
    ) -> StoreResult<Vec<Offer>>;
}
