//! The ride aggregate and its status state machine.
//!
//! The state machine is a pure function over a fixed adjacency table: no
//! side effects, no I/O, no clock. Requesting the status a ride already has
//! is an idempotent no-op at the domain level; every other edge outside the
//! table is rejected before anything is written.

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::types::{DriverId, GeoPoint, RideId, RiderId, Timestamp};

/// Lifecycle status of a ride.
///
/// The forward path is REQUESTED → MATCHING → OFFERED → DRIVER_ASSIGNED →
/// IN_PROGRESS → COMPLETED. CANCELLED is reachable from every non-terminal
/// status except IN_PROGRESS. COMPLETED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    /// The rider has submitted the request.
    Requested,
    /// Matching is searching for candidate drivers.
    Matching,
    /// At least one driver has an open offer for the ride.
    Offered,
    /// A driver is committed to the ride.
    DriverAssigned,
    /// The ride is under way.
    InProgress,
    /// The ride finished normally. Terminal.
    Completed,
    /// The ride was cancelled before completion. Terminal.
    Cancelled,
}

impl RideStatus {
    /// Returns the canonical wire representation of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Matching => "MATCHING",
            Self::Offered => "OFFERED",
            Self::DriverAssigned => "DRIVER_ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns whether this status admits no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns whether a ride in this status must carry a driver.
    ///
    /// This is the representation half of the aggregate invariant: the
    /// driver identifier is set if and only if the status requires it.
    /// Store adapters derive the stored driver column from this, which is
    /// what clears the driver when a driver-assigned ride is cancelled.
    pub const fn requires_driver(self) -> bool {
        matches!(self, Self::DriverAssigned | Self::InProgress | Self::Completed)
    }

    /// Returns whether `next` is directly reachable from this status.
    ///
    /// This is the fixed adjacency table; [`Self::transition_to`] layers
    /// the idempotent self-transition on top of it.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Matching)
                | (Self::Matching, Self::Offered)
                | (Self::Offered, Self::DriverAssigned)
                | (Self::DriverAssigned, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::Requested, Self::Cancelled)
                | (Self::Matching, Self::Cancelled)
                | (Self::Offered, Self::Cancelled)
                | (Self::DriverAssigned, Self::Cancelled)
        )
    }

    /// Validates a requested transition.
    ///
    /// Requesting the current status is a no-op that returns the status
    /// unchanged. Every other edge must appear in the adjacency table or
    /// the transition is rejected with
    /// [`DomainError::InvalidRideTransition`].
    pub fn transition_to(self, requested: Self) -> Result<Self, DomainError> {
        if self == requested {
            return Ok(self);
        }
        if self.can_transition_to(requested) {
            Ok(requested)
        } else {
            Err(DomainError::InvalidRideTransition {
                from: self,
                to: requested,
            })
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(Self::Requested),
            "MATCHING" => Ok(Self::Matching),
            "OFFERED" => Ok(Self::Offered),
            "DRIVER_ASSIGNED" => Ok(Self::DriverAssigned),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown ride status '{other}'")),
        }
    }
}

/// The ride aggregate.
///
/// Rides are created by the create-ride command, mutated only through
/// validated transitions, and never physically deleted by this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    /// Unique identifier of the ride.
    pub id: RideId,
    /// The rider who requested the ride.
    pub rider_id: RiderId,
    /// The assigned driver, present exactly when
    /// [`RideStatus::requires_driver`] holds for the current status.
    pub driver_id: Option<DriverId>,
    /// Current lifecycle status.
    pub status: RideStatus,
    /// Where the rider wants to be picked up.
    pub pickup: GeoPoint,
    /// Where the rider wants to go.
    pub dropoff: GeoPoint,
    /// When the ride was requested.
    pub created_at: Timestamp,
    /// When the ride last changed.
    pub updated_at: Timestamp,
}

impl Ride {
    /// Creates a freshly requested ride with a new identifier.
    pub fn request(rider_id: RiderId, pickup: GeoPoint, dropoff: GeoPoint, now: Timestamp) -> Self {
        Self {
            id: RideId::new(),
            rider_id,
            driver_id: None,
            status: RideStatus::Requested,
            pickup,
            dropoff,
            created_at: now,
            updated_at: now,
        }
    }
}
