//! Error taxonomy for the reservation engine.
//!
//! [`StoreError`] is what persistence backends report. [`EngineError`] is
//! what callers of the engine see; each variant maps onto an HTTP status and
//! a machine-readable code so the transport layer never has to match on
//! message strings.

use crate::policy::PolicyValidationError;
use std::fmt;
use thiserror::Error;

/// Machine-readable reason for a business-rule conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConflictCode {
    /// Not enough free capacity on the offer
    InsufficientCapacity,
    /// Reservation already paid
    AlreadyPaid,
    /// Hold deadline passed
    Expired,
    /// Actor does not own the reservation or offer
    NotOwned,
    /// Transition not valid from the current status
    InvalidState,
    /// Reservation already cancelled
    AlreadyCancelled,
    /// Every unit already refunded
    AlreadyRefunded,
    /// Cancel window closed
    CancelPeriodExpired,
    /// Offer rule forbids cancelling once shipped
    CancelNotAllowedAfterShipped,
    /// Refund policy rejects the request
    RefundNotAllowed,
    /// Requested refund quantity exceeds what remains
    RefundQuantityExceeded,
    /// Quantity must be positive
    InvalidQuantity,
    /// Idempotency key already used for a different request
    IdempotencyKeyReused,
    /// Settlement is blocked
    SettlementBlocked,
    /// Lost too many optimistic races
    ConcurrentModification,
}

impl ConflictCode {
    /// Stable string form
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientCapacity => "INSUFFICIENT_CAPACITY",
            Self::AlreadyPaid => "ALREADY_PAID",
            Self::Expired => "EXPIRED",
            Self::NotOwned => "NOT_OWNED",
            Self::InvalidState => "INVALID_STATE",
            Self::AlreadyCancelled => "ALREADY_CANCELLED",
            Self::AlreadyRefunded => "ALREADY_REFUNDED",
            Self::CancelPeriodExpired => "CANCEL_PERIOD_EXPIRED",
            Self::CancelNotAllowedAfterShipped => "CANCEL_NOT_ALLOWED_AFTER_SHIPPED",
            Self::RefundNotAllowed => "REFUND_NOT_ALLOWED",
            Self::RefundQuantityExceeded => "REFUND_QUANTITY_EXCEEDED",
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Self::SettlementBlocked => "SETTLEMENT_BLOCKED",
            Self::ConcurrentModification => "CONCURRENT_MODIFICATION",
        }
    }
}

impl fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a [`ReservationStore`](crate::store::ReservationStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row changed since it was read.
    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
        /// Version the writer read
        expected: u64,
    },

    /// Settlement status changed since it was read.
    #[error("Status mismatch on settlement {id}: expected {expected}")]
    StatusMismatch {
        /// Settlement id
        id: String,
        /// Status the writer read
        expected: String,
    },

    /// Capacity check failed inside the atomic counter update.
    #[error("Capacity exceeded: {available} available")]
    CapacityExceeded {
        /// Units still free at the time of the check
        available: u32,
    },

    /// A counter would go below zero.
    #[error("Counter underflow on offer {offer_id}: {counter}")]
    CounterUnderflow {
        /// Offer id
        offer_id: String,
        /// `reserved_qty` or `sold_qty`
        counter: &'static str,
    },

    /// Unique key already present.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Row referenced by a write does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// Serialization failure or deadlock reported by the database.
    #[error("Transaction contention: {0}")]
    Contention(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Lost an optimistic race; re-reading and re-applying may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::StatusMismatch { .. } | Self::Contention(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Entity absent; not retried.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// Business-rule violation surfaced as 409; never retried automatically.
    #[error("{message}")]
    Conflict {
        /// Machine-readable reason
        code: ConflictCode,
        /// Human-readable detail naming the current state
        message: String,
    },

    /// Malformed request input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Policy bundle failed validation.
    #[error(transparent)]
    Policy(#[from] PolicyValidationError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Build a [`EngineError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build a [`EngineError::Conflict`].
    pub fn conflict(code: ConflictCode, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    /// HTTP status the transport layer should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::InvalidRequest(_) | Self::Policy(_) => 422,
            Self::Store(_) => 500,
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { code, .. } => code.as_str(),
            Self::InvalidRequest(_) => "VALIDATION_ERROR",
            Self::Policy(_) => "POLICY_VALIDATION_ERROR",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }

    /// Conflict code, if this is a conflict.
    #[must_use]
    pub const fn conflict_code(&self) -> Option<ConflictCode> {
        match self {
            Self::Conflict { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True if a fresh attempt might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}
