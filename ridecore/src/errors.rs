//! Error types for the ride lifecycle engine.
//!
//! This module provides typed errors for all failure scenarios in the
//! engine. The error design follows these principles:
//!
//! - **Rich error information**: Include context to help diagnose issues
//! - **Type safety**: Different error types for different subsystems
//! - **Actionable**: Callers can determine how to handle each error
//! - **Composable**: Errors can be converted between layers
//!
//! # Error Categories
//!
//! - [`DomainError`]: State-machine violations, rejected before any write
//! - [`StoreError`]: Persistence failures, including lost compare-and-swap
//!   races
//! - [`CommandError`]: The caller-facing taxonomy produced by the command
//!   handlers
//! - [`PublishError`]: Broker delivery failures, visible only to the outbox
//!   publisher worker
//! - [`ValidationError`]: Input validation failures (rare due to smart
//!   constructors)

use thiserror::Error;

use crate::domain::{OfferStatus, RideStatus};
use crate::types::{DriverId, EventId, OfferId, RideId};

/// Errors produced by the pure domain state machines.
///
/// Domain errors are precondition failures: they are detected before any
/// write happens, are never retried by the engine, and never register an
/// idempotency record, so a corrected retry with the same key can succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The requested ride status is not reachable from the current status.
    #[error("ride cannot move from {from} to {to}")]
    InvalidRideTransition {
        /// The ride's current status.
        from: RideStatus,
        /// The status that was requested.
        to: RideStatus,
    },

    /// The requested offer status is not reachable from the current status.
    #[error("offer cannot move from {from} to {to}")]
    InvalidOfferTransition {
        /// The offer's current status.
        from: OfferStatus,
        /// The status that was requested.
        to: OfferStatus,
    },

    /// An offer was opened with a zero or negative time-to-live.
    #[error("offer ttl must be positive, got {seconds}s")]
    NonPositiveTtl {
        /// The rejected ttl, in whole seconds.
        seconds: i64,
    },
}

/// Errors that can occur when interacting with the lifecycle store.
///
/// `StoreError` represents failures at the persistence layer. The conflict
/// variants are the visible half of optimistic concurrency control: the
/// caller whose expected-status assumption no longer held loses the race
/// and receives the current value for diagnostics.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The referenced ride does not exist.
    #[error("ride '{0}' not found")]
    RideNotFound(RideId),

    /// The referenced offer does not exist.
    #[error("offer '{0}' not found")]
    OfferNotFound(OfferId),

    /// The referenced outbox message does not exist.
    #[error("outbox message '{0}' not found")]
    MessageNotFound(EventId),

    /// A conditional ride write lost a race: the stored status no longer
    /// matched the expected status at write time.
    #[error("ride '{id}' status conflict: expected {expected}, but current is {current}")]
    RideConflict {
        /// The ride that was being updated.
        id: RideId,
        /// The status the caller expected to find.
        expected: RideStatus,
        /// The status actually stored.
        current: RideStatus,
    },

    /// A conditional offer write lost a race.
    #[error("offer '{id}' status conflict: expected {expected}, but current is {current}")]
    OfferConflict {
        /// The offer that was being updated.
        id: OfferId,
        /// The status the caller expected to find.
        expected: OfferStatus,
        /// The status actually stored.
        current: OfferStatus,
    },

    /// A pending offer already exists for this (ride, driver) pair.
    #[error("driver '{driver_id}' already has a pending offer for ride '{ride_id}'")]
    DuplicateOffer {
        /// The ride the offer was issued against.
        ride_id: RideId,
        /// The driver that already holds a pending offer.
        driver_id: DriverId,
    },

    /// A payload or snapshot could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The connection to the store failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors that can occur during command execution.
///
/// `CommandError` is the taxonomy surfaced to command callers. It
/// distinguishes failures that are the caller's to fix (invalid
/// transitions, validation), failures that a caller may retry at its own
/// discretion (conflicts), and failures that indicate trouble below the
/// waterline (store errors).
///
/// # Error Handling Strategy
///
/// - **InvalidTransition** / **ValidationFailed**: fix the request; never
///   retried by the engine
/// - **RideNotFound** / **OfferNotFound**: check the identifier
/// - **Conflict**: a concurrent writer won; re-read and retry if the caller
///   still wants the transition
/// - **Store** / **Internal**: log and investigate; the transaction was
///   fully aborted and the aggregate is unchanged
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The requested transition is not present in the domain table.
    #[error("invalid transition: {0}")]
    InvalidTransition(DomainError),

    /// The command input failed a domain precondition other than the
    /// transition table (for example a non-positive offer ttl).
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The referenced ride does not exist.
    #[error("ride not found: {0}")]
    RideNotFound(RideId),

    /// The referenced offer does not exist.
    #[error("offer not found: {0}")]
    OfferNotFound(OfferId),

    /// Optimistic concurrency control detected a conflicting update.
    #[error("state conflict: {0}")]
    Conflict(StoreError),

    /// An unexpected error occurred in the lifecycle store. The whole
    /// transaction was aborted; nothing was partially committed.
    #[error("store error: {0}")]
    Store(StoreError),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors that can occur while delivering an outbox message to the broker.
///
/// Publish errors never reach a command caller: the publisher worker
/// retries them on its own schedule and dead-letters the row once the
/// attempt budget is exhausted.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The broker rejected the message.
    #[error("broker rejected message: {0}")]
    Rejected(String),

    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur during validation of smart constructor inputs.
///
/// These should be rare in practice because validation happens at system
/// boundaries when parsing raw input into domain types. Once constructed,
/// those types guarantee validity throughout the program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The input value was out of the allowed range.
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Type alias for command results.
pub type CommandResult<T> = Result<T, CommandError>;

/// Type alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<DomainError> for CommandError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NonPositiveTtl { .. } => Self::ValidationFailed(err.to_string()),
            DomainError::InvalidRideTransition { .. }
            | DomainError::InvalidOfferTransition { .. } => Self::InvalidTransition(err),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RideNotFound(id) => Self::RideNotFound(id),
            StoreError::OfferNotFound(id) => Self::OfferNotFound(id),
            StoreError::RideConflict { .. }
            | StoreError::OfferConflict { .. }
            | StoreError::DuplicateOffer { .. } => Self::Conflict(err),
            other => Self::Store(other),
        }
    }
}

impl From<ValidationError> for CommandError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_messages_are_descriptive() {
        let err = DomainError::InvalidRideTransition {
            from: RideStatus::Completed,
            to: RideStatus::Matching,
        };
        assert_eq!(err.to_string(), "ride cannot move from COMPLETED to MATCHING");

        let err = DomainError::NonPositiveTtl { seconds: -5 };
        assert_eq!(err.to_string(), "offer ttl must be positive, got -5s");
    }

    #[test]
    fn store_conflict_messages_carry_both_statuses() {
        let id = RideId::new();
        let err = StoreError::RideConflict {
            id,
            expected: RideStatus::Offered,
            current: RideStatus::Cancelled,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("expected OFFERED"));
        assert!(rendered.contains("current is CANCELLED"));
    }

    #[test]
    fn conflicts_convert_to_command_conflicts() {
        let id = OfferId::new();
        let store_err = StoreError::OfferConflict {
            id,
            expected: OfferStatus::Pending,
            current: OfferStatus::Accepted,
        };
        match CommandError::from(store_err) {
            CommandError::Conflict(StoreError::OfferConflict { .. }) => {}
            other => panic!("expected Conflict variant, got {other:?}"),
        }
    }

    #[test]
    fn not_found_converts_to_typed_not_found() {
        let id = RideId::new();
        match CommandError::from(StoreError::RideNotFound(id)) {
            CommandError::RideNotFound(found) => assert_eq!(found, id),
            other => panic!("expected RideNotFound, got {other:?}"),
        }
    }

    #[test]
    fn ttl_error_converts_to_validation_failure() {
        let err = DomainError::NonPositiveTtl { seconds: 0 };
        match CommandError::from(err) {
            CommandError::ValidationFailed(msg) => assert!(msg.contains("ttl")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_store_errors_stay_internal() {
        let err = StoreError::Connection("pool exhausted".to_string());
        match CommandError::from(err) {
            CommandError::Store(StoreError::Connection(msg)) => {
                assert_eq!(msg, "pool exhausted");
            }
            other => panic!("expected Store variant, got {other:?}"),
        }
    }
}
