//! The driver offer aggregate and its status state machine.
//!
//! Offers are issued per (ride, driver) pair and live for a fixed ttl set
//! at creation. The state machine never consults the clock: expiry is only
//! applied when the expiry reaper or an explicit expire command requests
//! the PENDING → EXPIRED transition, so a stale clock can never silently
//! flip an offer under a concurrent accept.

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::types::{DriverId, OfferId, RideId, Timestamp};

/// Lifecycle status of a driver offer.
///
/// PENDING is the only non-terminal status; ACCEPTED, DECLINED and EXPIRED
/// are all terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    /// The offer is awaiting the driver's answer.
    Pending,
    /// The driver accepted. Terminal.
    Accepted,
    /// The driver declined. Terminal.
    Declined,
    /// The offer lapsed unanswered. Terminal.
    Expired,
}

impl OfferStatus {
    /// Returns the canonical wire representation of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Returns whether this status admits no further transitions.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Validates a requested transition.
    ///
    /// Requesting the current status is a no-op. The only real edges are
    /// PENDING → {ACCEPTED, DECLINED, EXPIRED}; anything attempted from a
    /// terminal status fails with [`DomainError::InvalidOfferTransition`].
    pub fn transition_to(self, requested: Self) -> Result<Self, DomainError> {
        if self == requested {
            return Ok(self);
        }
        if matches!(self, Self::Pending) {
            Ok(requested)
        } else {
            Err(DomainError::InvalidOfferTransition {
                from: self,
                to: requested,
            })
        }
    }
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "DECLINED" => Ok(Self::Declined),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown offer status '{other}'")),
        }
    }
}

/// The driver offer aggregate.
///
/// The expiry timestamp is fixed at creation and never extended; an offer
/// is immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Unique identifier of the offer.
    pub id: OfferId,
    /// The ride the offer was issued against.
    pub ride_id: RideId,
    /// The driver the offer was issued to.
    pub driver_id: DriverId,
    /// Current lifecycle status.
    pub status: OfferStatus,
    /// The instant past which the offer may be expired.
    pub expires_at: Timestamp,
    /// When the offer was issued.
    pub created_at: Timestamp,
}

impl Offer {
    /// Opens a pending offer expiring `ttl` after `now`.
    ///
    /// The ttl must be strictly positive; a zero or negative ttl is
    /// rejected before anything is persisted.
    pub fn open(
        ride_id: RideId,
        driver_id: DriverId,
        ttl: chrono::Duration,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        if ttl <= chrono::Duration::zero() {
            return Err(DomainError::NonPositiveTtl {
                seconds: ttl.num_seconds(),
            });
        }
        Ok(Self {
            id: OfferId::new(),
            ride_id,
            driver_id,
            status: OfferStatus::Pending,
            expires_at: now.advanced_by(ttl),
            created_at: now,
        })
    }

    /// Returns whether the offer is past its expiry instant.
    ///
    /// This is a pure comparison against the caller-supplied clock; it does
    /// not change the status. Only the expire command does that.
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.status == OfferStatus::Pending && self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OfferStatus; 4] = [
        OfferStatus::Pending,
        OfferStatus::Accepted,
        OfferStatus::Declined,
        OfferStatus::Expired,
    ];

    #[test]
    fn pending_reaches_every_terminal_status() {
        for terminal in [OfferStatus::Accepted, OfferStatus::Declined, OfferStatus::Expired] {
            assert_eq!(OfferStatus::Pending.transition_to(terminal), Ok(terminal));
        }
    }

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                if from == to {
                    assert_eq!(from.transition_to(to), Ok(to));
                } else {
                    assert!(from.transition_to(to).is_err(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn open_rejects_non_positive_ttl() {
        let now = Timestamp::now();
        let ride_id = RideId::new();
        let driver_id = DriverId::new();

        let zero = Offer::open(ride_id, driver_id, chrono::Duration::zero(), now);
        assert_eq!(zero, Err(DomainError::NonPositiveTtl { seconds: 0 }));

        let negative = Offer::open(ride_id, driver_id, chrono::Duration::seconds(-30), now);
        assert_eq!(negative, Err(DomainError::NonPositiveTtl { seconds: -30 }));
    }

    #[test]
    fn open_fixes_expiry_relative_to_now() {
        let now = Timestamp::now();
        let offer = Offer::open(
            RideId::new(),
            DriverId::new(),
            chrono::Duration::seconds(45),
            now,
        )
        .unwrap();
        assert_eq!(offer.status, OfferStatus::Pending);
        assert_eq!(offer.expires_at, now.advanced_by(chrono::Duration::seconds(45)));
    }

    #[test]
    fn overdue_requires_pending_and_elapsed_expiry() {
        let now = Timestamp::now();
        let mut offer = Offer::open(
            RideId::new(),
            DriverId::new(),
            chrono::Duration::seconds(10),
            now,
        )
        .unwrap();

        assert!(!offer.is_overdue(now));
        let later = now.advanced_by(chrono::Duration::seconds(11));
        assert!(offer.is_overdue(later));

        offer.status = OfferStatus::Accepted;
        assert!(!offer.is_overdue(later));
    }

    #[test]
    fn status_round_trips_through_its_wire_form() {
        for status in ALL {
            let parsed: OfferStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("OPEN".parse::<OfferStatus>().is_err());
    }
}
