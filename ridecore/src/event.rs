//! Outbound domain event envelopes.
//!
//! Every committed state transition produces exactly one envelope. The
//! envelope is serialized into the outbox row inside the same transaction
//! as the state change, and later delivered by the publisher worker; the
//! broker is never contacted on the command path.
//!
//! The event type string encodes the new status (`ride.requested`,
//! `ride.offer.accepted`, ...). The `ride.offer.created` event doubles as
//! the record of the ride's OFFERED transition, which is how each command
//! emits exactly one event.

use serde::{Deserialize, Serialize};

use crate::domain::{Offer, OfferStatus, Ride, RideStatus};
use crate::types::{EventId, Timestamp};

/// Name stamped into every envelope's `producer` field.
pub const PRODUCER: &str = "ridecore";

/// The envelope wrapped around every outbound domain event.
///
/// The event identifier is a UUIDv7 and is the deduplication key for
/// downstream consumers: delivery is at-least-once, so consumers must drop
/// envelopes whose identifier they have already processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique, time-ordered event identifier.
    pub event_id: EventId,
    /// Dotted event type string encoding the new status.
    pub event_type: String,
    /// Name of the producing service.
    pub producer: String,
    /// When the transition was committed.
    pub occurred_at: Timestamp,
    /// Request correlation identifier, when the caller supplied one.
    pub correlation_id: Option<String>,
    /// Snapshot of the aggregate at the moment of transition.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Builds an envelope describing a ride transition.
    ///
    /// The payload is a snapshot of the ride as committed; the event type
    /// is derived from the ride's (new) status.
    pub fn for_ride(
        ride: &Ride,
        correlation_id: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: EventId::new(),
            event_type: ride_event_type(ride.status).to_string(),
            producer: PRODUCER.to_string(),
            occurred_at: ride.updated_at,
            correlation_id,
            payload: serde_json::to_value(ride)?,
        })
    }

    /// Builds an envelope describing an offer transition.
    pub fn for_offer(
        offer: &Offer,
        occurred_at: Timestamp,
        correlation_id: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: EventId::new(),
            event_type: offer_event_type(offer.status).to_string(),
            producer: PRODUCER.to_string(),
            occurred_at,
            correlation_id,
            payload: serde_json::to_value(offer)?,
        })
    }
}

/// Maps a ride status to the event type emitted when a ride enters it.
pub const fn ride_event_type(status: RideStatus) -> &'static str {
    match status {
        RideStatus::Requested => "ride.requested",
        RideStatus::Matching => "ride.matching",
        RideStatus::Offered => "ride.offered",
        RideStatus::DriverAssigned => "ride.driver_assigned",
        RideStatus::InProgress => "ride.in_progress",
        RideStatus::Completed => "ride.completed",
        RideStatus::Cancelled => "ride.cancelled",
    }
}

/// Maps an offer status to the event type emitted when an offer enters it.
pub const fn offer_event_type(status: OfferStatus) -> &'static str {
    match status {
        OfferStatus::Pending => "ride.offer.created",
        OfferStatus::Accepted => "ride.offer.accepted",
        OfferStatus::Declined => "ride.offer.declined",
        OfferStatus::Expired => "ride.offer.expired",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DriverId, GeoPoint, RideId, RiderId};

    fn sample_ride() -> Ride {
        Ride::request(
            RiderId::new(),
            GeoPoint::try_new(40.7128, -74.006).unwrap(),
            GeoPoint::try_new(40.73, -73.99).unwrap(),
            Timestamp::now(),
        )
    }

    #[test]
    fn ride_envelope_carries_type_producer_and_snapshot() {
        let ride = sample_ride();
        let envelope = EventEnvelope::for_ride(&ride, Some("req-7".to_string())).unwrap();

        assert_eq!(envelope.event_type, "ride.requested");
        assert_eq!(envelope.producer, PRODUCER);
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(envelope.occurred_at, ride.updated_at);
        assert_eq!(
            envelope.payload["status"],
            serde_json::Value::String("REQUESTED".to_string())
        );
        assert_eq!(
            envelope.payload["id"],
            serde_json::Value::String(ride.id.to_string())
        );
    }

    #[test]
    fn offer_envelope_types_follow_the_status() {
        let now = Timestamp::now();
        let mut offer = Offer::open(
            RideId::new(),
            DriverId::new(),
            chrono::Duration::seconds(30),
            now,
        )
        .unwrap();

        let created = EventEnvelope::for_offer(&offer, now, None).unwrap();
        assert_eq!(created.event_type, "ride.offer.created");

        offer.status = OfferStatus::Expired;
        let expired = EventEnvelope::for_offer(&offer, now, None).unwrap();
        assert_eq!(expired.event_type, "ride.offer.expired");
    }

    #[test]
    fn every_ride_status_has_a_distinct_event_type() {
        let statuses = [
            RideStatus::Requested,
            RideStatus::Matching,
            RideStatus::Offered,
            RideStatus::DriverAssigned,
            RideStatus::InProgress,
            RideStatus::Completed,
            RideStatus::Cancelled,
        ];
        let mut seen = std::collections::HashSet::new();
        for status in statuses {
            let event_type = ride_event_type(status);
            assert!(event_type.starts_with("ride."));
            assert!(seen.insert(event_type), "duplicate type {event_type}");
        }
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let ride = sample_ride();
        let envelope = EventEnvelope::for_ride(&ride, None).unwrap();
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: EventEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }
}
