//! Command handlers for the ride and offer lifecycles.
//!
//! [`LifecycleEngine`] owns one handler per verb. Every handler follows the
//! same pipeline:
//!
//! 1. Consult the idempotency guard; a hit returns the stored response
//!    verbatim with no mutation, no repository write and no outbox row.
//! 2. Load the current aggregate (transition verbs) or construct a fresh
//!    one (create verbs).
//! 3. Run the pure state machine.
//! 4. Persist through the store's compare-and-swap write, co-committing
//!    exactly one outbox event and — when a key was supplied — the
//!    idempotency record, all in one transaction.
//! 5. Return the resulting aggregate's identifier and status.
//!
//! Domain validation failures abort before any write and never register an
//! idempotency record; storage conflicts surface directly and are never
//! retried here — retry policy belongs to the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{Offer, OfferStatus, Ride, RideStatus};
use crate::errors::{CommandError, CommandResult};
use crate::event::EventEnvelope;
use crate::observer::{LifecycleObserver, NoopObserver};
use crate::store::{IdempotencyRecord, LifecycleStore, RideTransition};
use crate::types::{DriverId, GeoPoint, IdempotencyKey, OfferId, RideId, RiderId, Timestamp};

/// Per-call options common to every command.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Client-supplied deduplication key. `None` disables deduplication
    /// for this call, which is what internal callers such as the expiry
    /// reaper use.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Request correlation identifier propagated into the event envelope.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    /// A context carrying only a deduplication key.
    pub fn keyed(key: IdempotencyKey) -> Self {
        Self {
            idempotency_key: Some(key),
            correlation_id: None,
        }
    }
}

/// The response returned by every command: the resulting aggregate's
/// identifier and status.
///
/// This is also the value serialized into the idempotency record, so a
/// replayed call returns content byte-identical to the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReceipt {
    /// Identifier of the ride or offer the command acted on.
    pub aggregate_id: Uuid,
    /// The aggregate's status after the command, in wire form.
    pub status: String,
}

impl CommandReceipt {
    fn for_ride(ride: &Ride) -> Self {
        Self {
            aggregate_id: ride.id.into_inner(),
            status: ride.status.as_str().to_string(),
        }
    }

    fn for_offer(offer: &Offer) -> Self {
        Self {
            aggregate_id: offer.id.into_inner(),
            status: offer.status.as_str().to_string(),
        }
    }
}

/// Input for the create-ride command.
#[derive(Debug, Clone)]
pub struct CreateRide {
    /// The requesting rider.
    pub rider_id: RiderId,
    /// Pickup location.
    pub pickup: GeoPoint,
    /// Dropoff location.
    pub dropoff: GeoPoint,
}

/// Input for the start-matching command.
#[derive(Debug, Clone)]
pub struct StartMatching {
    /// The ride to move into MATCHING.
    pub ride_id: RideId,
}

/// Input for the assign-driver command.
#[derive(Debug, Clone)]
pub struct AssignDriver {
    /// The ride to commit the driver to.
    pub ride_id: RideId,
    /// The driver being assigned.
    pub driver_id: DriverId,
}

/// Input for the start-ride command.
#[derive(Debug, Clone)]
pub struct StartRide {
    /// The ride to move into IN_PROGRESS.
    pub ride_id: RideId,
}

/// Input for the complete-ride command.
#[derive(Debug, Clone)]
pub struct CompleteRide {
    /// The ride to complete.
    pub ride_id: RideId,
}

/// Input for the cancel-ride command.
#[derive(Debug, Clone)]
pub struct CancelRide {
    /// The ride to cancel.
    pub ride_id: RideId,
}

/// Input for the create-offer command.
#[derive(Debug, Clone)]
pub struct CreateOffer {
    /// The ride the offer is issued against.
    pub ride_id: RideId,
    /// The driver receiving the offer.
    pub driver_id: DriverId,
    /// How long the offer stays open; must be strictly positive.
    pub ttl: chrono::Duration,
}

/// Input for the accept-offer command.
#[derive(Debug, Clone)]
pub struct AcceptOffer {
    /// The offer being accepted.
    pub offer_id: OfferId,
}

/// Input for the decline-offer command.
#[derive(Debug, Clone)]
pub struct DeclineOffer {
    /// The offer being declined.
    pub offer_id: OfferId,
}

/// Input for the expire-offer command.
#[derive(Debug, Clone)]
pub struct ExpireOffer {
    /// The offer being expired.
    pub offer_id: OfferId,
}

/// How a successful handler concluded, for observer accounting.
enum Outcome {
    Applied(CommandReceipt),
    Replayed(CommandReceipt),
}

/// The command-handling facade of the lifecycle engine.
///
/// The engine holds exclusive, constructor-injected references to its
/// store and observer; there is no global state. It is cheap to share
/// behind an [`Arc`] — every handler takes `&self`.
pub struct LifecycleEngine<S> {
    store: Arc<S>,
    observer: Arc<dyn LifecycleObserver>,
}

impl<S> LifecycleEngine<S>
where
    S: LifecycleStore,
{
    /// Creates an engine over the given store with a no-op observer.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Creates a new ride in REQUESTED and emits `ride.requested`.
    #[instrument(skip(self, cmd, ctx), fields(rider_id = %cmd.rider_id))]
    pub async fn create_ride(
        &self,
        cmd: CreateRide,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self.create_ride_inner(cmd, &ctx).await;
        self.finish("create_ride", outcome)
    }

    /// Moves a ride REQUESTED → MATCHING and emits `ride.matching`.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id))]
    pub async fn start_matching(
        &self,
        cmd: StartMatching,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_ride(cmd.ride_id, RideStatus::Matching, &ctx)
            .await;
        self.finish("start_matching", outcome)
    }

    /// Commits a driver to an OFFERED ride and emits `ride.driver_assigned`.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id, driver_id = %cmd.driver_id))]
    pub async fn assign_driver(
        &self,
        cmd: AssignDriver,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self.assign_driver_inner(cmd, &ctx).await;
        self.finish("assign_driver", outcome)
    }

    /// Moves a ride DRIVER_ASSIGNED → IN_PROGRESS and emits
    /// `ride.in_progress`.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id))]
    pub async fn start_ride(
        &self,
        cmd: StartRide,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_ride(cmd.ride_id, RideStatus::InProgress, &ctx)
            .await;
        self.finish("start_ride", outcome)
    }

    /// Moves a ride IN_PROGRESS → COMPLETED and emits `ride.completed`.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id))]
    pub async fn complete_ride(
        &self,
        cmd: CompleteRide,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_ride(cmd.ride_id, RideStatus::Completed, &ctx)
            .await;
        self.finish("complete_ride", outcome)
    }

    /// Cancels a ride from any pre-trip status and emits `ride.cancelled`.
    ///
    /// Cancelling a driver-assigned ride clears the driver, keeping the
    /// driver-presence invariant intact.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id))]
    pub async fn cancel_ride(
        &self,
        cmd: CancelRide,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_ride(cmd.ride_id, RideStatus::Cancelled, &ctx)
            .await;
        self.finish("cancel_ride", outcome)
    }

    /// Opens a PENDING offer for a driver and emits `ride.offer.created`.
    ///
    /// The ride's first offer also moves the ride MATCHING → OFFERED in
    /// the same transaction; later offers leave the ride untouched.
    #[instrument(skip(self, cmd, ctx), fields(ride_id = %cmd.ride_id, driver_id = %cmd.driver_id))]
    pub async fn create_offer(
        &self,
        cmd: CreateOffer,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self.create_offer_inner(cmd, &ctx).await;
        self.finish("create_offer", outcome)
    }

    /// Moves an offer PENDING → ACCEPTED and emits `ride.offer.accepted`.
    #[instrument(skip(self, cmd, ctx), fields(offer_id = %cmd.offer_id))]
    pub async fn accept_offer(
        &self,
        cmd: AcceptOffer,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_offer(cmd.offer_id, OfferStatus::Accepted, &ctx)
            .await;
        self.finish("accept_offer", outcome)
    }

    /// Moves an offer PENDING → DECLINED and emits `ride.offer.declined`.
    #[instrument(skip(self, cmd, ctx), fields(offer_id = %cmd.offer_id))]
    pub async fn decline_offer(
        &self,
        cmd: DeclineOffer,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_offer(cmd.offer_id, OfferStatus::Declined, &ctx)
            .await;
        self.finish("decline_offer", outcome)
    }

    /// Moves an offer PENDING → EXPIRED and emits `ride.offer.expired`.
    ///
    /// Invoked by the expiry reaper with no idempotency key; the
    /// compare-and-swap write already makes a double expiry harmless.
    #[instrument(skip(self, cmd, ctx), fields(offer_id = %cmd.offer_id))]
    pub async fn expire_offer(
        &self,
        cmd: ExpireOffer,
        ctx: CommandContext,
    ) -> CommandResult<CommandReceipt> {
        let outcome = self
            .transition_offer(cmd.offer_id, OfferStatus::Expired, &ctx)
            .await;
        self.finish("expire_offer", outcome)
    }

    async fn create_ride_inner(
        &self,
        cmd: CreateRide,
        ctx: &CommandContext,
    ) -> CommandResult<Outcome> {
        if let Some(receipt) = self.replay(ctx).await? {
            return Ok(Outcome::Replayed(receipt));
        }

        let now = Timestamp::now();
        let ride = Ride::request(cmd.rider_id, cmd.pickup, cmd.dropoff, now);
        let envelope = self.ride_envelope(&ride, ctx)?;
        let receipt = CommandReceipt::for_ride(&ride);
        let record = self.snapshot(ctx, &receipt, now)?;

        self.store
            .insert_ride(&ride, &envelope, record.as_ref())
            .await?;
        Ok(Outcome::Applied(receipt))
    }

    async fn assign_driver_inner(
        &self,
        cmd: AssignDriver,
        ctx: &CommandContext,
    ) -> CommandResult<Outcome> {
        if let Some(receipt) = self.replay(ctx).await? {
            return Ok(Outcome::Replayed(receipt));
        }

        let ride = self.store.fetch_ride(cmd.ride_id).await?;
        let next = ride.status.transition_to(RideStatus::DriverAssigned)?;
        let now = Timestamp::now();

        let mut updated = ride.clone();
        updated.status = next;
        updated.driver_id = Some(cmd.driver_id);
        updated.updated_at = now;

        let envelope = self.ride_envelope(&updated, ctx)?;
        let receipt = CommandReceipt::for_ride(&updated);
        let record = self.snapshot(ctx, &receipt, now)?;

        self.store
            .assign_driver_if_current(
                cmd.ride_id,
                ride.status,
                cmd.driver_id,
                now,
                &envelope,
                record.as_ref(),
            )
            .await?;
        Ok(Outcome::Applied(receipt))
    }

    async fn create_offer_inner(
        &self,
        cmd: CreateOffer,
        ctx: &CommandContext,
    ) -> CommandResult<Outcome> {
        if let Some(receipt) = self.replay(ctx).await? {
            return Ok(Outcome::Replayed(receipt));
        }

        let ride = self.store.fetch_ride(cmd.ride_id).await?;
        let ride_next = ride.status.transition_to(RideStatus::Offered)?;
        let now = Timestamp::now();
        let offer = Offer::open(cmd.ride_id, cmd.driver_id, cmd.ttl, now)?;

        let ride_transition = (ride.status != ride_next).then(|| RideTransition {
            ride_id: cmd.ride_id,
            expected: ride.status,
            next: ride_next,
            updated_at: now,
        });

        let envelope = self.offer_envelope(&offer, now, ctx)?;
        let receipt = CommandReceipt::for_offer(&offer);
        let record = self.snapshot(ctx, &receipt, now)?;

        self.store
            .insert_offer(&offer, ride_transition.as_ref(), &envelope, record.as_ref())
            .await?;
        Ok(Outcome::Applied(receipt))
    }

    async fn transition_ride(
        &self,
        id: RideId,
        requested: RideStatus,
        ctx: &CommandContext,
    ) -> CommandResult<Outcome> {
        if let Some(receipt) = self.replay(ctx).await? {
            return Ok(Outcome::Replayed(receipt));
        }

        let ride = self.store.fetch_ride(id).await?;
        let next = ride.status.transition_to(requested)?;
        let now = Timestamp::now();

        let mut updated = ride.clone();
        updated.status = next;
        updated.updated_at = now;
        if !next.requires_driver() {
            updated.driver_id = None;
        }

        let envelope = self.ride_envelope(&updated, ctx)?;
        let receipt = CommandReceipt::for_ride(&updated);
        let record = self.snapshot(ctx, &receipt, now)?;

        self.store
            .update_ride_status_if_current(id, ride.status, next, now, &envelope, record.as_ref())
            .await?;
        Ok(Outcome::Applied(receipt))
    }

    async fn transition_offer(
        &self,
        id: OfferId,
        requested: OfferStatus,
        ctx: &CommandContext,
    ) -> CommandResult<Outcome> {
        if let Some(receipt) = self.replay(ctx).await? {
            return Ok(Outcome::Replayed(receipt));
        }

        let offer = self.store.fetch_offer(id).await?;
        let next = offer.status.transition_to(requested)?;
        let now = Timestamp::now();

        let mut updated = offer.clone();
        updated.status = next;

        let envelope = self.offer_envelope(&updated, now, ctx)?;
        let receipt = CommandReceipt::for_offer(&updated);
        let record = self.snapshot(ctx, &receipt, now)?;

        self.store
            .update_offer_status_if_current(id, offer.status, next, &envelope, record.as_ref())
            .await?;
        Ok(Outcome::Applied(receipt))
    }

    /// Answers a keyed command from its stored snapshot, if one exists.
    async fn replay(&self, ctx: &CommandContext) -> CommandResult<Option<CommandReceipt>> {
        let Some(key) = ctx.idempotency_key.as_ref() else {
            return Ok(None);
        };
        let Some(record) = self.store.fetch_idempotency(key).await? else {
            return Ok(None);
        };
        let receipt = serde_json::from_value(record.response).map_err(|e| {
            CommandError::Internal(format!("stored idempotency snapshot is corrupt: {e}"))
        })?;
        Ok(Some(receipt))
    }

    /// Builds the idempotency record for a keyed command, if a key was
    /// supplied.
    fn snapshot(
        &self,
        ctx: &CommandContext,
        receipt: &CommandReceipt,
        now: Timestamp,
    ) -> CommandResult<Option<IdempotencyRecord>> {
        ctx.idempotency_key
            .as_ref()
            .map(|key| {
                let response = serde_json::to_value(receipt)
                    .map_err(|e| CommandError::Internal(e.to_string()))?;
                Ok(IdempotencyRecord {
                    key: key.clone(),
                    response,
                    created_at: now,
                })
            })
            .transpose()
    }

    fn ride_envelope(&self, ride: &Ride, ctx: &CommandContext) -> CommandResult<EventEnvelope> {
        EventEnvelope::for_ride(ride, ctx.correlation_id.clone())
            .map_err(|e| CommandError::Internal(e.to_string()))
    }

    fn offer_envelope(
        &self,
        offer: &Offer,
        occurred_at: Timestamp,
        ctx: &CommandContext,
    ) -> CommandResult<EventEnvelope> {
        EventEnvelope::for_offer(offer, occurred_at, ctx.correlation_id.clone())
            .map_err(|e| CommandError::Internal(e.to_string()))
    }

    fn finish(
        &self,
        verb: &'static str,
        outcome: CommandResult<Outcome>,
    ) -> CommandResult<CommandReceipt> {
        match outcome {
            Ok(Outcome::Applied(receipt)) => {
                self.observer.command_applied(verb);
                Ok(receipt)
            }
            Ok(Outcome::Replayed(receipt)) => {
                self.observer.command_replayed(verb);
                Ok(receipt)
            }
            Err(error) => {
                self.observer.command_rejected(verb, &error);
                Err(error)
            }
        }
    }
}
