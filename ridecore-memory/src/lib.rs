//! In-memory adapter for the `RideCore` lifecycle engine.
//!
//! This crate provides an in-memory implementation of the
//! [`LifecycleStore`] trait from the ridecore crate, useful for testing
//! and development scenarios where persistence is not required.
//!
//! A single `RwLock` guards all tables, which is what makes the
//! multi-record commits (aggregate + outbox row + idempotency record)
//! atomic: a writer holds the lock for the whole commit, and every
//! compare-and-swap check happens under the same guard that applies the
//! write. Validation runs before the first mutation so a failed operation
//! leaves the tables untouched, mirroring a rolled-back transaction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use ridecore::domain::{Offer, OfferStatus, Ride, RideStatus};
use ridecore::errors::{StoreError, StoreResult};
use ridecore::event::EventEnvelope;
use ridecore::store::{
    IdempotencyRecord, LifecycleStore, OutboxMessage, OutboxStatus, RideTransition,
};
use ridecore::types::{DriverId, EventId, IdempotencyKey, OfferId, RideId, Timestamp};

/// Thread-safe in-memory lifecycle store for testing.
#[derive(Clone, Default)]
pub struct InMemoryLifecycleStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    rides: HashMap<RideId, Ride>,
    offers: HashMap<OfferId, Offer>,
    outbox: HashMap<EventId, OutboxMessage>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
}

impl InMemoryLifecycleStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("RwLock poisoned")
    }

    /// Applies a ride compare-and-swap under the write lock.
    ///
    /// `driver` overrides the stored driver when given; otherwise the
    /// driver column is derived from `next.requires_driver()`, which
    /// clears it on cancellation.
    fn apply_ride_cas(
        inner: &mut Inner,
        id: RideId,
        expected: RideStatus,
        next: RideStatus,
        driver: Option<DriverId>,
        updated_at: Timestamp,
    ) -> StoreResult<Ride> {
        let ride = inner
            .rides
            .get_mut(&id)
            .ok_or(StoreError::RideNotFound(id))?;
        if ride.status != expected {
            return Err(StoreError::RideConflict {
                id,
                expected,
                current: ride.status,
            });
        }
        ride.status = next;
        ride.updated_at = updated_at;
        ride.driver_id = match driver {
            Some(driver_id) => Some(driver_id),
            None if next.requires_driver() => ride.driver_id,
            None => None,
        };
        Ok(ride.clone())
    }

    /// Checks a ride compare-and-swap without applying it.
    fn check_ride_cas(inner: &Inner, id: RideId, expected: RideStatus) -> StoreResult<()> {
        let ride = inner.rides.get(&id).ok_or(StoreError::RideNotFound(id))?;
        if ride.status != expected {
            return Err(StoreError::RideConflict {
                id,
                expected,
                current: ride.status,
            });
        }
        Ok(())
    }

    fn check_idempotency_free(
        inner: &Inner,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()> {
        if let Some(record) = idempotency {
            if inner.idempotency.contains_key(&record.key) {
                return Err(StoreError::Internal(format!(
                    "idempotency key '{}' already recorded",
                    record.key
                )));
            }
        }
        Ok(())
    }

    fn commit_side_records(
        inner: &mut Inner,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
        now: Timestamp,
    ) -> StoreResult<()> {
        let row = OutboxMessage::pending(event, now)?;
        inner.outbox.insert(row.id, row);
        if let Some(record) = idempotency {
            inner.idempotency.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn fetch_ride(&self, id: RideId) -> StoreResult<Ride> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner
            .rides
            .get(&id)
            .cloned()
            .ok_or(StoreError::RideNotFound(id))
    }

    async fn fetch_offer(&self, id: OfferId) -> StoreResult<Offer> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner
            .offers
            .get(&id)
            .cloned()
            .ok_or(StoreError::OfferNotFound(id))
    }

    async fn insert_ride(
        &self,
        ride: &Ride,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()> {
        let mut inner = self.write();
        if inner.rides.contains_key(&ride.id) {
            return Err(StoreError::Internal(format!(
                "ride '{}' already exists",
                ride.id
            )));
        }
        Self::check_idempotency_free(&inner, idempotency)?;

        inner.rides.insert(ride.id, ride.clone());
        Self::commit_side_records(&mut inner, event, idempotency, ride.created_at)
    }

    async fn update_ride_status_if_current(
        &self,
        id: RideId,
        expected: RideStatus,
        next: RideStatus,
        updated_at: Timestamp,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Ride> {
        let mut inner = self.write();
        Self::check_ride_cas(&inner, id, expected)?;
        Self::check_idempotency_free(&inner, idempotency)?;

        let ride = Self::apply_ride_cas(&mut inner, id, expected, next, None, updated_at)?;
        Self::commit_side_records(&mut inner, event, idempotency, updated_at)?;
        Ok(ride)
    }

    async fn assign_driver_if_current(
        &self,
        id: RideId,
        expected: RideStatus,
        driver_id: DriverId,
        updated_at: Timestamp,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Ride> {
        let mut inner = self.write();
        Self::check_ride_cas(&inner, id, expected)?;
        Self::check_idempotency_free(&inner, idempotency)?;

        let ride = Self::apply_ride_cas(
            &mut inner,
            id,
            expected,
            RideStatus::DriverAssigned,
            Some(driver_id),
            updated_at,
        )?;
        Self::commit_side_records(&mut inner, event, idempotency, updated_at)?;
        Ok(ride)
    }

    async fn insert_offer(
        &self,
        offer: &Offer,
        ride_transition: Option<&RideTransition>,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()> {
        let mut inner = self.write();

        let duplicate = inner.offers.values().any(|existing| {
            existing.ride_id == offer.ride_id
                && existing.driver_id == offer.driver_id
                && existing.status == OfferStatus::Pending
        });
        if duplicate {
            return Err(StoreError::DuplicateOffer {
                ride_id: offer.ride_id,
                driver_id: offer.driver_id,
            });
        }
        if let Some(transition) = ride_transition {
            Self::check_ride_cas(&inner, transition.ride_id, transition.expected)?;
        } else {
            // The offer must still hang off an existing ride.
            if !inner.rides.contains_key(&offer.ride_id) {
                return Err(StoreError::RideNotFound(offer.ride_id));
            }
        }
        Self::check_idempotency_free(&inner, idempotency)?;

        if let Some(transition) = ride_transition {
            Self::apply_ride_cas(
                &mut inner,
                transition.ride_id,
                transition.expected,
                transition.next,
                None,
                transition.updated_at,
            )?;
        }
        inner.offers.insert(offer.id, offer.clone());
        Self::commit_side_records(&mut inner, event, idempotency, offer.created_at)
    }

    async fn update_offer_status_if_current(
        &self,
        id: OfferId,
        expected: OfferStatus,
        next: OfferStatus,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Offer> {
        let mut inner = self.write();

        let current = inner
            .offers
            .get(&id)
            .ok_or(StoreError::OfferNotFound(id))?
            .status;
        if current != expected {
            return Err(StoreError::OfferConflict {
                id,
                expected,
                current,
            });
        }
        Self::check_idempotency_free(&inner, idempotency)?;

        let offer = inner
            .offers
            .get_mut(&id)
            .ok_or(StoreError::OfferNotFound(id))?;
        offer.status = next;
        let updated = offer.clone();

        Self::commit_side_records(&mut inner, event, idempotency, event.occurred_at)?;
        Ok(updated)
    }

    async fn fetch_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let inner = self.inner.read().expect("RwLock poisoned");
        Ok(inner.idempotency.get(key).cloned())
    }

    async fn claim_due_messages(
        &self,
        batch: usize,
        now: Timestamp,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let mut inner = self.write();

        let mut due: Vec<EventId> = inner
            .outbox
            .values()
            .filter(|row| row.status == OutboxStatus::Pending && row.next_attempt_at <= now)
            .map(|row| row.id)
            .collect();
        due.sort_by_key(|id| {
            let row = &inner.outbox[id];
            (row.next_attempt_at, row.id)
        });
        due.truncate(batch);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let row = inner
                .outbox
                .get_mut(&id)
                .ok_or(StoreError::MessageNotFound(id))?;
            row.status = OutboxStatus::Claimed;
            row.claimed_at = Some(now);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: EventId) -> StoreResult<()> {
        let mut inner = self.write();
        let row = inner
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        row.status = OutboxStatus::Sent;
        row.claimed_at = None;
        Ok(())
    }

    async fn schedule_redelivery(
        &self,
        id: EventId,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.write();
        let row = inner
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        row.status = OutboxStatus::Pending;
        row.attempts = attempts;
        row.next_attempt_at = next_attempt_at;
        row.claimed_at = None;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_dead(&self, id: EventId, error: &str) -> StoreResult<()> {
        let mut inner = self.write();
        let row = inner
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        row.status = OutboxStatus::Dead;
        row.claimed_at = None;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn release_stale_claims(&self, older_than: Timestamp) -> StoreResult<u64> {
        let mut inner = self.write();
        let mut released = 0;
        for row in inner.outbox.values_mut() {
            if row.status == OutboxStatus::Claimed
                && row.claimed_at.is_some_and(|at| at <= older_than)
            {
                row.status = OutboxStatus::Pending;
                row.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn replay_dead_messages(&self, limit: usize) -> StoreResult<u64> {
        let mut inner = self.write();

        let mut dead: Vec<EventId> = inner
            .outbox
            .values()
            .filter(|row| row.status == OutboxStatus::Dead)
            .map(|row| row.id)
            .collect();
        dead.sort_by_key(|id| {
            let row = &inner.outbox[id];
            (row.created_at, row.id)
        });
        dead.truncate(limit);

        let now = Timestamp::now();
        let mut replayed = 0;
        for id in dead {
            let row = inner
                .outbox
                .get_mut(&id)
                .ok_or(StoreError::MessageNotFound(id))?;
            row.status = OutboxStatus::Pending;
            row.attempts = 0;
            row.next_attempt_at = now;
            row.last_error = None;
            replayed += 1;
        }
        Ok(replayed)
    }

    async fn count_outbox(&self, status: OutboxStatus) -> StoreResult<u64> {
        let inner = self.inner.read().expect("RwLock poisoned");
        Ok(inner
            .outbox
            .values()
            .filter(|row| row.status == status)
            .count() as u64)
    }

    async fn outbox_message(&self, id: EventId) -> StoreResult<OutboxMessage> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner
            .outbox
            .get(&id)
            .cloned()
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn expired_pending_offers(
        &self,
        now: Timestamp,
        batch: usize,
    ) -> StoreResult<Vec<Offer>> {
        let inner = self.inner.read().expect("RwLock poisoned");
        let mut overdue: Vec<Offer> = inner
            .offers
            .values()
            .filter(|offer| offer.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|offer| (offer.expires_at, offer.id));
        overdue.truncate(batch);
        Ok(overdue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridecore::types::{GeoPoint, RiderId};

    fn sample_ride(now: Timestamp) -> Ride {
        Ride::request(
            RiderId::new(),
            GeoPoint::try_new(48.8566, 2.3522).unwrap(),
            GeoPoint::try_new(48.86, 2.34).unwrap(),
            now,
        )
    }

    fn ride_envelope(ride: &Ride) -> EventEnvelope {
        EventEnvelope::for_ride(ride, None).unwrap()
    }

    fn offer_envelope(offer: &Offer, now: Timestamp) -> EventEnvelope {
        EventEnvelope::for_offer(offer, now, None).unwrap()
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let ride = sample_ride(now);

        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();
        let fetched = store.fetch_ride(ride.id).await.unwrap();
        assert_eq!(fetched, ride);
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cas_rejects_a_stale_expected_status() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let ride = sample_ride(now);
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();

        let mut moved = ride.clone();
        moved.status = RideStatus::Matching;
        store
            .update_ride_status_if_current(
                ride.id,
                RideStatus::Requested,
                RideStatus::Matching,
                now,
                &ride_envelope(&moved),
                None,
            )
            .await
            .unwrap();

        // A second writer still expecting REQUESTED loses.
        let result = store
            .update_ride_status_if_current(
                ride.id,
                RideStatus::Requested,
                RideStatus::Cancelled,
                now,
                &ride_envelope(&moved),
                None,
            )
            .await;
        match result {
            Err(StoreError::RideConflict {
                expected, current, ..
            }) => {
                assert_eq!(expected, RideStatus::Requested);
                assert_eq!(current, RideStatus::Matching);
            }
            other => panic!("expected RideConflict, got {other:?}"),
        }

        // The losing writer committed nothing.
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelling_an_assigned_ride_clears_the_driver() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let mut ride = sample_ride(now);
        ride.status = RideStatus::Offered;
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();

        let driver = DriverId::new();
        let assigned = store
            .assign_driver_if_current(
                ride.id,
                RideStatus::Offered,
                driver,
                now,
                &ride_envelope(&ride),
                None,
            )
            .await
            .unwrap();
        assert_eq!(assigned.driver_id, Some(driver));

        let cancelled = store
            .update_ride_status_if_current(
                ride.id,
                RideStatus::DriverAssigned,
                RideStatus::Cancelled,
                now,
                &ride_envelope(&ride),
                None,
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert!(cancelled.driver_id.is_none());
    }

    #[tokio::test]
    async fn one_pending_offer_per_ride_and_driver() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let mut ride = sample_ride(now);
        ride.status = RideStatus::Offered;
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();

        let driver = DriverId::new();
        let offer = Offer::open(ride.id, driver, chrono::Duration::seconds(30), now).unwrap();
        store
            .insert_offer(&offer, None, &offer_envelope(&offer, now), None)
            .await
            .unwrap();

        let second = Offer::open(ride.id, driver, chrono::Duration::seconds(30), now).unwrap();
        let result = store
            .insert_offer(&second, None, &offer_envelope(&second, now), None)
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateOffer { .. })));

        // Settling the first offer frees the pair for a new one.
        store
            .update_offer_status_if_current(
                offer.id,
                OfferStatus::Pending,
                OfferStatus::Declined,
                &offer_envelope(&offer, now),
                None,
            )
            .await
            .unwrap();
        let third = Offer::open(ride.id, driver, chrono::Duration::seconds(30), now).unwrap();
        store
            .insert_offer(&third, None, &offer_envelope(&third, now), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_ordered() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let ride = sample_ride(now);
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();

        let claimed = store.claim_due_messages(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OutboxStatus::Claimed);

        // Already claimed: a second worker gets nothing.
        let again = store.claim_due_messages(10, now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn stale_claims_are_released_future_claims_are_not() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let ride = sample_ride(now);
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();
        let claimed = store.claim_due_messages(10, now).await.unwrap();
        let id = claimed[0].id;

        // Cutoff before the claim: nothing released.
        let earlier = now.advanced_by(chrono::Duration::seconds(-60));
        assert_eq!(store.release_stale_claims(earlier).await.unwrap(), 0);

        // Cutoff at/after the claim: released back to PENDING.
        assert_eq!(store.release_stale_claims(now).await.unwrap(), 1);
        let row = store.outbox_message(id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert!(row.claimed_at.is_none());
    }

    #[tokio::test]
    async fn replay_resets_dead_rows_with_a_fresh_budget() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let ride = sample_ride(now);
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();
        let claimed = store.claim_due_messages(10, now).await.unwrap();
        let id = claimed[0].id;
        store.mark_dead(id, "broker offline").await.unwrap();
        assert_eq!(store.count_outbox(OutboxStatus::Dead).await.unwrap(), 1);

        assert_eq!(store.replay_dead_messages(10).await.unwrap(), 1);
        let row = store.outbox_message(id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn expired_scan_only_returns_overdue_pending_offers() {
        let store = InMemoryLifecycleStore::new();
        let now = Timestamp::now();
        let mut ride = sample_ride(now);
        ride.status = RideStatus::Offered;
        store
            .insert_ride(&ride, &ride_envelope(&ride), None)
            .await
            .unwrap();

        let overdue =
            Offer::open(ride.id, DriverId::new(), chrono::Duration::seconds(5), now).unwrap();
        let fresh =
            Offer::open(ride.id, DriverId::new(), chrono::Duration::minutes(10), now).unwrap();
        store
            .insert_offer(&overdue, None, &offer_envelope(&overdue, now), None)
            .await
            .unwrap();
        store
            .insert_offer(&fresh, None, &offer_envelope(&fresh, now), None)
            .await
            .unwrap();

        let later = now.advanced_by(chrono::Duration::seconds(6));
        let scanned = store.expired_pending_offers(later, 10).await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].id, overdue.id);
    }
}
