use async_trait::async_trait;
use uuid::Uuid;
use crate::models::{Booking, BookingStatus, Offer};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// Lock wait timeout, deadlock, serialization failure, lost connection.
    /// Safe to retry the whole transaction from the start.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn booking_not_found(id: Uuid) -> Self {
        LedgerError::NotFound { entity: "booking", id }
    }

    pub fn offer_not_found(id: Uuid) -> Self {
        LedgerError::NotFound { entity: "offer", id }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

/// Storage for bookings and the offers they target.
///
/// All status writes happen inside a [`LedgerTransaction`] obtained from [`begin`].
/// The read-only methods on the ledger itself take no locks and are only meant for
/// display purposes.
///
/// [`begin`]: BookingLedger::begin
#[async_trait]
pub trait BookingLedger: Send + Sync {
    type Tx: LedgerTransaction;

    async fn begin(&self) -> Result<Self::Tx, LedgerError>;

    async fn find_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, LedgerError>;

    async fn confirmed_seats(&self, offer_id: Uuid) -> Result<i32, LedgerError>;
}

/// One open transaction against the ledger. Dropping it without calling
/// [`commit`](LedgerTransaction::commit) discards every write.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Loads the booking and its offer, holding exclusive locks on both rows until the
    /// transaction ends. The offer row is locked first so that every decision on the
    /// same offer runs one at a time, whichever booking it targets.
    async fn lock_booking_and_offer(
        &mut self,
        booking_id: Uuid,
    ) -> Result<(Booking, Offer), LedgerError>;

    /// Seats held by confirmed bookings on `offer_id`, not counting `excluding`.
    async fn sum_confirmed_seats(
        &mut self,
        offer_id: Uuid,
        excluding: Uuid,
    ) -> Result<i32, LedgerError>;

    async fn set_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<(), LedgerError>;

    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}
