pub mod models;
pub mod notify;
pub mod repository;

pub use models::{Booking, BookingStatus, Offer, OfferStatus, SeatAvailability};
pub use notify::{Notification, NotificationKind, NotificationSink, NotifyError};
pub use repository::{BookingLedger, LedgerError, LedgerTransaction};

use uuid::Uuid;

/// Caller-facing outcome of a booking decision. Only `Unavailable` is worth retrying,
/// and only after a delay.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("caller {caller} may not act on booking {booking_id}")]
    Forbidden { booking_id: Uuid, caller: Uuid },

    #[error("booking {booking_id} cannot move from {current} to {attempted}")]
    InvalidState {
        booking_id: Uuid,
        current: BookingStatus,
        attempted: BookingStatus,
    },

    #[error("requested {requested} seats but only {available} available")]
    CapacityExceeded { requested: i32, available: i32 },

    #[error("booking service unavailable: {0}")]
    Unavailable(String),
}

impl BookingError {
    /// Stable code for clients to branch on.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "NOT_FOUND",
            BookingError::Forbidden { .. } => "FORBIDDEN",
            BookingError::InvalidState { .. } => "INVALID_STATE",
            BookingError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            BookingError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    pub fn available_seats(&self) -> Option<i32> {
        match self {
            BookingError::CapacityExceeded { available, .. } => Some(*available),
            _ => None,
        }
    }

    pub fn current_status(&self) -> Option<BookingStatus> {
        match self {
            BookingError::InvalidState { current, .. } => Some(*current),
            _ => None,
        }
    }
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => BookingError::NotFound { entity, id },
            other => BookingError::Unavailable(other.to_string()),
        }
    }
}

pub type BookingResult<T> = Result<T, BookingError>;
