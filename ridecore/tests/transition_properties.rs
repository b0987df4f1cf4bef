//! Property-based tests for the ride and offer state machines.
//!
//! The allowed-edge lists here are written out independently of the
//! implementation so the tables are checked against a second source of
//! truth rather than against themselves.

use proptest::prelude::*;

use ridecore::{OfferStatus, RideStatus};

const RIDE_STATUSES: [RideStatus; 7] = [
    RideStatus::Requested,
    RideStatus::Matching,
    RideStatus::Offered,
    RideStatus::DriverAssigned,
    RideStatus::InProgress,
    RideStatus::Completed,
    RideStatus::Cancelled,
];

const RIDE_EDGES: [(RideStatus, RideStatus); 9] = [
    (RideStatus::Requested, RideStatus::Matching),
    (RideStatus::Matching, RideStatus::Offered),
    (RideStatus::Offered, RideStatus::DriverAssigned),
    (RideStatus::DriverAssigned, RideStatus::InProgress),
    (RideStatus::InProgress, RideStatus::Completed),
    (RideStatus::Requested, RideStatus::Cancelled),
    (RideStatus::Matching, RideStatus::Cancelled),
    (RideStatus::Offered, RideStatus::Cancelled),
    (RideStatus::DriverAssigned, RideStatus::Cancelled),
];

const OFFER_STATUSES: [OfferStatus; 4] = [
    OfferStatus::Pending,
    OfferStatus::Accepted,
    OfferStatus::Declined,
    OfferStatus::Expired,
];

const OFFER_EDGES: [(OfferStatus, OfferStatus); 3] = [
    (OfferStatus::Pending, OfferStatus::Accepted),
    (OfferStatus::Pending, OfferStatus::Declined),
    (OfferStatus::Pending, OfferStatus::Expired),
];

fn arb_ride_status() -> impl Strategy<Value = RideStatus> {
    prop::sample::select(RIDE_STATUSES.to_vec())
}

fn arb_offer_status() -> impl Strategy<Value = OfferStatus> {
    prop::sample::select(OFFER_STATUSES.to_vec())
}

proptest! {
    #[test]
    fn ride_transitions_match_the_edge_list(
        from in arb_ride_status(),
        to in arb_ride_status(),
    ) {
        let result = from.transition_to(to);
        if from == to {
            prop_assert_eq!(result, Ok(from));
        } else if RIDE_EDGES.contains(&(from, to)) {
            prop_assert_eq!(result, Ok(to));
        } else {
            prop_assert!(result.is_err(), "{} -> {} must be rejected", from, to);
        }
    }

    #[test]
    fn rejected_ride_transitions_name_both_endpoints(
        from in arb_ride_status(),
        to in arb_ride_status(),
    ) {
        if from != to && !RIDE_EDGES.contains(&(from, to)) {
            let message = from.transition_to(to).unwrap_err().to_string();
            prop_assert!(message.contains(from.as_str()));
            prop_assert!(message.contains(to.as_str()));
        }
    }

    #[test]
    fn offer_transitions_match_the_edge_list(
        from in arb_offer_status(),
        to in arb_offer_status(),
    ) {
        let result = from.transition_to(to);
        if from == to {
            prop_assert_eq!(result, Ok(from));
        } else if OFFER_EDGES.contains(&(from, to)) {
            prop_assert_eq!(result, Ok(to));
        } else {
            prop_assert!(result.is_err(), "{} -> {} must be rejected", from, to);
        }
    }

    #[test]
    fn terminal_ride_statuses_stay_terminal(
        to in arb_ride_status(),
    ) {
        for terminal in [RideStatus::Completed, RideStatus::Cancelled] {
            if to != terminal {
                prop_assert!(terminal.transition_to(to).is_err());
            }
        }
    }
}

#[test]
fn exhaustive_ride_grid_agrees_with_the_edge_list() {
    for from in RIDE_STATUSES {
        for to in RIDE_STATUSES {
            let allowed = from == to || RIDE_EDGES.contains(&(from, to));
            assert_eq!(
                from.transition_to(to).is_ok(),
                allowed,
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn exhaustive_offer_grid_agrees_with_the_edge_list() {
    for from in OFFER_STATUSES {
        for to in OFFER_STATUSES {
            let allowed = from == to || OFFER_EDGES.contains(&(from, to));
            assert_eq!(
                from.transition_to(to).is_ok(),
                allowed,
                "{from} -> {to}"
            );
        }
    }
}
