//! Domain aggregates and their pure state machines.
//!
//! Everything in this module is side-effect free: transitions are validated
//! against fixed tables and the clock only ever enters through caller
//! supplied timestamps. Persistence, events and concurrency control live a
//! layer up, in [`crate::store`] and [`crate::engine`].

mod offer;
mod ride;

pub use offer::{Offer, OfferStatus};
pub use ride::{Ride, RideStatus};
