//! [`LifecycleStore`] implementation over `PostgreSQL`.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use ridecore::domain::{Offer, OfferStatus, Ride, RideStatus};
use ridecore::errors::{StoreError, StoreResult};
use ridecore::event::EventEnvelope;
use ridecore::store::{
    IdempotencyRecord, LifecycleStore, OutboxMessage, OutboxStatus, RideTransition,
};
use ridecore::types::{DriverId, EventId, IdempotencyKey, OfferId, RideId, RiderId, Timestamp};

use crate::PostgresLifecycleStore;

const RIDE_COLUMNS: &str = "id, rider_id, driver_id, status, pickup_lat, pickup_lng, \
     dropoff_lat, dropoff_lng, created_at, updated_at";

const OFFER_COLUMNS: &str = "id, ride_id, driver_id, status, expires_at, created_at";

const OUTBOX_COLUMNS: &str =
    "id, topic, payload, status, attempts, next_attempt_at, claimed_at, last_error, created_at";

/// Maps connection-level failures to [`StoreError::Connection`] and
/// everything else to [`StoreError::Internal`].
fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => StoreError::Connection(err.to_string()),
        other => StoreError::Internal(other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

fn internal(err: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(err.to_string())
}

fn ride_from_row(row: &PgRow) -> StoreResult<Ride> {
    let id: Uuid = row.try_get("id").map_err(store_error)?;
    let rider_id: Uuid = row.try_get("rider_id").map_err(store_error)?;
    let driver_id: Option<Uuid> = row.try_get("driver_id").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;
    let pickup_lat: f64 = row.try_get("pickup_lat").map_err(store_error)?;
    let pickup_lng: f64 = row.try_get("pickup_lng").map_err(store_error)?;
    let dropoff_lat: f64 = row.try_get("dropoff_lat").map_err(store_error)?;
    let dropoff_lng: f64 = row.try_get("dropoff_lng").map_err(store_error)?;
    let created_at: chrono::DateTime<chrono::Utc> =
        row.try_get("created_at").map_err(store_error)?;
    let updated_at: chrono::DateTime<chrono::Utc> =
        row.try_get("updated_at").map_err(store_error)?;

    Ok(Ride {
        id: RideId::try_new(id).map_err(internal)?,
        rider_id: RiderId::try_new(rider_id).map_err(internal)?,
        driver_id: driver_id
            .map(|d| DriverId::try_new(d).map_err(internal))
            .transpose()?,
        status: status.parse::<RideStatus>().map_err(StoreError::Internal)?,
        pickup: ridecore::types::GeoPoint::try_new(pickup_lat, pickup_lng).map_err(internal)?,
        dropoff: ridecore::types::GeoPoint::try_new(dropoff_lat, dropoff_lng).map_err(internal)?,
        created_at: Timestamp::new(created_at),
        updated_at: Timestamp::new(updated_at),
    })
}

fn offer_from_row(row: &PgRow) -> StoreResult<Offer> {
    let id: Uuid = row.try_get("id").map_err(store_error)?;
    let ride_id: Uuid = row.try_get("ride_id").map_err(store_error)?;
    let driver_id: Uuid = row.try_get("driver_id").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;
    let expires_at: chrono::DateTime<chrono::Utc> =
        row.try_get("expires_at").map_err(store_error)?;
    let created_at: chrono::DateTime<chrono::Utc> =
        row.try_get("created_at").map_err(store_error)?;

    Ok(Offer {
        id: OfferId::try_new(id).map_err(internal)?,
        ride_id: RideId::try_new(ride_id).map_err(internal)?,
        driver_id: DriverId::try_new(driver_id).map_err(internal)?,
        status: status.parse::<OfferStatus>().map_err(StoreError::Internal)?,
        expires_at: Timestamp::new(expires_at),
        created_at: Timestamp::new(created_at),
    })
}

fn outbox_from_row(row: &PgRow) -> StoreResult<OutboxMessage> {
    let id: Uuid = row.try_get("id").map_err(store_error)?;
    let topic: String = row.try_get("topic").map_err(store_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(store_error)?;
    let next_attempt_at: chrono::DateTime<chrono::Utc> =
        row.try_get("next_attempt_at").map_err(store_error)?;
    let claimed_at: Option<chrono::DateTime<chrono::Utc>> =
        row.try_get("claimed_at").map_err(store_error)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(store_error)?;
    let created_at: chrono::DateTime<chrono::Utc> =
        row.try_get("created_at").map_err(store_error)?;

    Ok(OutboxMessage {
        id: EventId::try_new(id).map_err(internal)?,
        topic,
        payload,
        status: status.parse::<OutboxStatus>().map_err(StoreError::Internal)?,
        attempts: u32::try_from(attempts).map_err(internal)?,
        next_attempt_at: Timestamp::new(next_attempt_at),
        claimed_at: claimed_at.map(Timestamp::new),
        last_error,
        created_at: Timestamp::new(created_at),
    })
}

/// Inserts the outbox row and the optional idempotency record inside the
/// caller's transaction.
async fn insert_side_records(
    tx: &mut Transaction<'_, Postgres>,
    event: &EventEnvelope,
    idempotency: Option<&IdempotencyRecord>,
    now: Timestamp,
) -> StoreResult<()> {
    let row = OutboxMessage::pending(event, now)?;
    sqlx::query(
        "INSERT INTO outbox_messages \
         (id, topic, payload, status, attempts, next_attempt_at, claimed_at, last_error, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(row.id.into_inner())
    .bind(&row.topic)
    .bind(&row.payload)
    .bind(row.status.as_str())
    .bind(i32::try_from(row.attempts).map_err(internal)?)
    .bind(row.next_attempt_at.into_datetime())
    .bind(row.claimed_at.map(Timestamp::into_datetime))
    .bind(row.last_error.as_deref())
    .bind(row.created_at.into_datetime())
    .execute(&mut **tx)
    .await
    .map_err(store_error)?;

    if let Some(record) = idempotency {
        let result = sqlx::query(
            "INSERT INTO idempotency_records (key, response, created_at) VALUES ($1, $2, $3)",
        )
        .bind(record.key.to_string())
        .bind(&record.response)
        .bind(record.created_at.into_datetime())
        .execute(&mut **tx)
        .await;
        if let Err(err) = result {
            if is_unique_violation(&err) {
                return Err(StoreError::Internal(format!(
                    "idempotency key '{}' already recorded",
                    record.key
                )));
            }
            return Err(store_error(err));
        }
    }
    Ok(())
}

/// Applies a ride compare-and-swap inside the caller's transaction.
///
/// `driver_id`, when set, overrides the stored driver; otherwise the
/// driver column is kept or cleared according to `next.requires_driver()`.
async fn apply_ride_cas(
    tx: &mut Transaction<'_, Postgres>,
    id: RideId,
    expected: RideStatus,
    next: RideStatus,
    driver_id: Option<DriverId>,
    updated_at: Timestamp,
) -> StoreResult<Ride> {
    let query = match driver_id {
        Some(_) => format!(
            "UPDATE rides SET status = $2, driver_id = $3, updated_at = $4 \
             WHERE id = $1 AND status = $5 RETURNING {RIDE_COLUMNS}"
        ),
        None => format!(
            "UPDATE rides \
             SET status = $2, driver_id = CASE WHEN $3 THEN driver_id ELSE NULL END, \
                 updated_at = $4 \
             WHERE id = $1 AND status = $5 RETURNING {RIDE_COLUMNS}"
        ),
    };

    let mut sqlx_query = sqlx::query(&query)
        .bind(id.into_inner())
        .bind(next.as_str());
    sqlx_query = match driver_id {
        Some(driver) => sqlx_query.bind(driver.into_inner()),
        None => sqlx_query.bind(next.requires_driver()),
    };
    let row = sqlx_query
        .bind(updated_at.into_datetime())
        .bind(expected.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_error)?;

    match row {
        Some(row) => ride_from_row(&row),
        None => {
            // Zero rows: either the ride is gone or the status moved.
            let current: Option<String> = sqlx::query_scalar("SELECT status FROM rides WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(&mut **tx)
                .await
                .map_err(store_error)?;
            match current {
                None => Err(StoreError::RideNotFound(id)),
                Some(status) => Err(StoreError::RideConflict {
                    id,
                    expected,
                    current: status.parse::<RideStatus>().map_err(StoreError::Internal)?,
                }),
            }
        }
    }
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    async fn fetch_ride(&self, id: RideId) -> StoreResult<Ride> {
        let row = sqlx::query(&format!("SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"))
            .bind(id.into_inner())
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?;
        row.as_ref()
            .map(ride_from_row)
            .transpose()?
            .ok_or(StoreError::RideNotFound(id))
    }

    async fn fetch_offer(&self, id: OfferId) -> StoreResult<Offer> {
        let row = sqlx::query(&format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1"))
            .bind(id.into_inner())
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?;
        row.as_ref()
            .map(offer_from_row)
            .transpose()?
            .ok_or(StoreError::OfferNotFound(id))
    }

    async fn insert_ride(
        &self,
        ride: &Ride,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await.map_err(store_error)?;

        sqlx::query(
            "INSERT INTO rides \
             (id, rider_id, driver_id, status, pickup_lat, pickup_lng, \
              dropoff_lat, dropoff_lng, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(ride.id.into_inner())
        .bind(ride.rider_id.into_inner())
        .bind(ride.driver_id.map(DriverId::into_inner))
        .bind(ride.status.as_str())
        .bind(ride.pickup.latitude())
        .bind(ride.pickup.longitude())
        .bind(ride.dropoff.latitude())
        .bind(ride.dropoff.longitude())
        .bind(ride.created_at.into_datetime())
        .bind(ride.updated_at.into_datetime())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        insert_side_records(&mut tx, event, idempotency, ride.created_at).await?;
        tx.commit().await.map_err(store_error)
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
        let mut tx = self.pool().begin().await.map_err(store_error)?;
        let ride = apply_ride_cas(&mut tx, id, expected, next, None, updated_at).await?;
        insert_side_records(&mut tx, event, idempotency, updated_at).await?;
        tx.commit().await.map_err(store_error)?;
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
        let mut tx = self.pool().begin().await.map_err(store_error)?;
        let ride = apply_ride_cas(
            &mut tx,
            id,
            expected,
            RideStatus::DriverAssigned,
            Some(driver_id),
            updated_at,
        )
        .await?;
        insert_side_records(&mut tx, event, idempotency, updated_at).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(ride)
    }

    async fn insert_offer(
        &self,
        offer: &Offer,
        ride_transition: Option<&RideTransition>,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await.map_err(store_error)?;

        if let Some(transition) = ride_transition {
            apply_ride_cas(
                &mut tx,
                transition.ride_id,
                transition.expected,
                transition.next,
                None,
                transition.updated_at,
            )
            .await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO offers (id, ride_id, driver_id, status, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(offer.id.into_inner())
        .bind(offer.ride_id.into_inner())
        .bind(offer.driver_id.into_inner())
        .bind(offer.status.as_str())
        .bind(offer.expires_at.into_datetime())
        .bind(offer.created_at.into_datetime())
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::DuplicateOffer {
                    ride_id: offer.ride_id,
                    driver_id: offer.driver_id,
                });
            }
            if is_foreign_key_violation(&err) {
                return Err(StoreError::RideNotFound(offer.ride_id));
            }
            return Err(store_error(err));
        }

        insert_side_records(&mut tx, event, idempotency, offer.created_at).await?;
        tx.commit().await.map_err(store_error)
    }

    async fn update_offer_status_if_current(
        &self,
        id: OfferId,
        expected: OfferStatus,
        next: OfferStatus,
        event: &EventEnvelope,
        idempotency: Option<&IdempotencyRecord>,
    ) -> StoreResult<Offer> {
        let mut tx = self.pool().begin().await.map_err(store_error)?;

        let row = sqlx::query(&format!(
            "UPDATE offers SET status = $2 WHERE id = $1 AND status = $3 \
             RETURNING {OFFER_COLUMNS}"
        ))
        .bind(id.into_inner())
        .bind(next.as_str())
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let offer = match row {
            Some(row) => offer_from_row(&row)?,
            None => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM offers WHERE id = $1")
                        .bind(id.into_inner())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(store_error)?;
                return match current {
                    None => Err(StoreError::OfferNotFound(id)),
                    Some(status) => Err(StoreError::OfferConflict {
                        id,
                        expected,
                        current: status.parse::<OfferStatus>().map_err(StoreError::Internal)?,
                    }),
                };
            }
        };

        insert_side_records(&mut tx, event, idempotency, event.occurred_at).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(offer)
    }

    async fn fetch_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            "SELECT key, response, created_at FROM idempotency_records WHERE key = $1",
        )
        .bind(key.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(store_error)?;

        row.map(|row| {
            let key: String = row.try_get("key").map_err(store_error)?;
            let response: serde_json::Value = row.try_get("response").map_err(store_error)?;
            let created_at: chrono::DateTime<chrono::Utc> =
                row.try_get("created_at").map_err(store_error)?;
            Ok(IdempotencyRecord {
                key: IdempotencyKey::try_new(key).map_err(internal)?,
                response,
                created_at: Timestamp::new(created_at),
            })
        })
        .transpose()
    }

    async fn claim_due_messages(
        &self,
        batch: usize,
        now: Timestamp,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let limit = i64::try_from(batch).map_err(internal)?;

        // FOR UPDATE SKIP LOCKED makes the claim safe across publisher
        // replicas: two workers never see the same row.
        let rows = sqlx::query(&format!(
            "WITH due AS ( \
                 SELECT id FROM outbox_messages \
                 WHERE status = 'PENDING' AND next_attempt_at <= $1 \
                 ORDER BY next_attempt_at ASC, id ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE outbox_messages SET status = 'CLAIMED', claimed_at = $1 \
             FROM due WHERE outbox_messages.id = due.id \
             RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(now.into_datetime())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(store_error)?;

        let mut claimed = rows
            .iter()
            .map(outbox_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        // UPDATE ... RETURNING does not preserve the CTE ordering.
        claimed.sort_by(|a, b| {
            (a.next_attempt_at, a.id).cmp(&(b.next_attempt_at, b.id))
        });
        Ok(claimed)
    }

    async fn mark_sent(&self, id: EventId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET status = 'SENT', claimed_at = NULL WHERE id = $1",
        )
        .bind(id.into_inner())
        .execute(self.pool())
        .await
        .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn schedule_redelivery(
        &self,
        id: EventId,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'PENDING', attempts = $2, next_attempt_at = $3, \
                 claimed_at = NULL, last_error = $4 \
             WHERE id = $1",
        )
        .bind(id.into_inner())
        .bind(i32::try_from(attempts).map_err(internal)?)
        .bind(next_attempt_at.into_datetime())
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn mark_dead(&self, id: EventId, error: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'DEAD', claimed_at = NULL, last_error = $2 \
             WHERE id = $1",
        )
        .bind(id.into_inner())
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn release_stale_claims(&self, older_than: Timestamp) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET status = 'PENDING', claimed_at = NULL \
             WHERE status = 'CLAIMED' AND claimed_at <= $1",
        )
        .bind(older_than.into_datetime())
        .execute(self.pool())
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn replay_dead_messages(&self, limit: usize) -> StoreResult<u64> {
        let limit = i64::try_from(limit).map_err(internal)?;
        let result = sqlx::query(
            "WITH dead AS ( \
                 SELECT id FROM outbox_messages WHERE status = 'DEAD' \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE outbox_messages \
             SET status = 'PENDING', attempts = 0, next_attempt_at = $2, last_error = NULL \
             FROM dead WHERE outbox_messages.id = dead.id",
        )
        .bind(limit)
        .bind(Timestamp::now().into_datetime())
        .execute(self.pool())
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn count_outbox(&self, status: OutboxStatus) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(self.pool())
                .await
                .map_err(store_error)?;
        u64::try_from(count).map_err(internal)
    }

    async fn outbox_message(&self, id: EventId) -> StoreResult<OutboxMessage> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool())
        .await
        .map_err(store_error)?;
        row.as_ref()
            .map(outbox_from_row)
            .transpose()?
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn expired_pending_offers(
        &self,
        now: Timestamp,
        batch: usize,
    ) -> StoreResult<Vec<Offer>> {
        let limit = i64::try_from(batch).map_err(internal)?;
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers \
             WHERE status = 'PENDING' AND expires_at <= $1 \
             ORDER BY expires_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(now.into_datetime())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(store_error)?;
        rows.iter().map(offer_from_row).collect()
    }
}
