use async_trait::async_trait;
use chrono::Utc;
use ride_core::{
    Booking, BookingError, BookingLedger, BookingResult, BookingStatus, LedgerError,
    LedgerTransaction, Notification, NotificationKind, NotificationSink, Offer, SeatAvailability,
};
use ride_shared::models::{BookingAcceptedEvent, BookingCancelledEvent, BookingRejectedEvent};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::retry::{retry_with_backoff, RetryPolicy};

/// The booking decisions exposed to transports.
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Driver confirms a pending booking if the offer still has room for it.
    async fn accept(&self, booking_id: Uuid, driver_id: Uuid) -> BookingResult<Booking>;

    /// Driver turns down a pending booking.
    async fn reject(&self, booking_id: Uuid, driver_id: Uuid) -> BookingResult<Booking>;

    /// Passenger withdraws a pending or confirmed booking.
    async fn cancel(&self, booking_id: Uuid, passenger_id: Uuid) -> BookingResult<Booking>;

    async fn available_seats(&self, offer_id: Uuid) -> BookingResult<SeatAvailability>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Reject,
    Cancel,
}

impl Decision {
    fn target(&self) -> BookingStatus {
        match self {
            Decision::Accept => BookingStatus::Confirmed,
            Decision::Reject => BookingStatus::Rejected,
            Decision::Cancel => BookingStatus::Cancelled,
        }
    }
}

/// Why one transaction attempt ended without committing.
enum Failure {
    Refused(BookingError),
    Ledger(LedgerError),
}

impl Failure {
    fn is_transient(&self) -> bool {
        matches!(self, Failure::Ledger(e) if e.is_transient())
    }
}

impl From<LedgerError> for Failure {
    fn from(err: LedgerError) -> Self {
        Failure::Ledger(err)
    }
}

impl From<BookingError> for Failure {
    fn from(err: BookingError) -> Self {
        Failure::Refused(err)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Refused(e) => write!(f, "{}", e),
            Failure::Ledger(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Clone)]
struct Outcome {
    booking: Booking,
    offer: Offer,
    previous: BookingStatus,
}

enum Applied {
    /// Status written in this transaction, still to be committed.
    Written(Outcome),
    /// An earlier attempt whose commit reported failure had in fact committed.
    AlreadyCommitted(Outcome),
}

/// Runs every status change on a booking as one short transaction:
/// lock offer and booking, check caller and state, check capacity when confirming,
/// write, commit. Notifications go out only after the commit.
///
/// Seat accounting is never cached here; correctness rests on the ledger's row locks,
/// so any number of coordinators (and processes) can share one database.
pub struct AcceptanceCoordinator<L: BookingLedger> {
    ledger: Arc<L>,
    notifier: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
}

impl<L: BookingLedger> AcceptanceCoordinator<L> {
    pub fn new(ledger: Arc<L>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            ledger,
            notifier,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn decide(
        &self,
        decision: Decision,
        booking_id: Uuid,
        caller: Uuid,
    ) -> BookingResult<Outcome> {
        // Written but not acknowledged by the database: the commit may still have landed.
        let in_doubt = Mutex::new(None);

        let result = retry_with_backoff(&self.retry, Failure::is_transient, || {
            self.attempt(decision, booking_id, caller, &in_doubt)
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(Failure::Refused(e)) => {
                info!("{:?} of booking {} refused: {}", decision, booking_id, e);
                Err(e)
            }
            Err(Failure::Ledger(LedgerError::NotFound { entity, id })) => {
                Err(BookingError::NotFound { entity, id })
            }
            Err(Failure::Ledger(e)) => {
                error!("{:?} of booking {} failed: {}", decision, booking_id, e);
                Err(BookingError::Unavailable(e.to_string()))
            }
        }
    }

    /// One transaction. Anything but a clean decision rolls back before returning.
    ///
    /// A commit error leaves the outcome in `in_doubt`. The commit may have reached the
    /// database before the connection failed, so the next attempt compares the locked
    /// row against it and reports success instead of `InvalidState`.
    async fn attempt(
        &self,
        decision: Decision,
        booking_id: Uuid,
        caller: Uuid,
        in_doubt: &Mutex<Option<Outcome>>,
    ) -> Result<Outcome, Failure> {
        let prior = in_doubt.lock().await.clone();
        let mut tx = self.ledger.begin().await?;

        match Self::apply(&mut tx, decision, booking_id, caller, prior.as_ref()).await {
            Ok(Applied::Written(outcome)) => {
                if let Err(e) = tx.commit().await {
                    *in_doubt.lock().await = Some(outcome);
                    return Err(e.into());
                }
                Ok(outcome)
            }
            Ok(Applied::AlreadyCommitted(outcome)) => {
                info!(
                    "{:?} of booking {} was committed by an earlier attempt",
                    decision, booking_id
                );
                self.release(tx, decision, booking_id).await;
                Ok(outcome)
            }
            Err(failure) => {
                self.release(tx, decision, booking_id).await;
                Err(failure)
            }
        }
    }

    async fn release(&self, tx: L::Tx, decision: Decision, booking_id: Uuid) {
        if let Err(e) = tx.rollback().await {
            warn!(
                "Rollback after {:?} of booking {} failed: {}",
                decision, booking_id, e
            );
        }
    }

    async fn apply(
        tx: &mut L::Tx,
        decision: Decision,
        booking_id: Uuid,
        caller: Uuid,
        prior: Option<&Outcome>,
    ) -> Result<Applied, Failure> {
        let (mut booking, offer) = tx.lock_booking_and_offer(booking_id).await?;

        let allowed = match decision {
            Decision::Accept | Decision::Reject => offer.is_driver(caller),
            Decision::Cancel => booking.is_passenger(caller),
        };
        if !allowed {
            return Err(BookingError::Forbidden { booking_id, caller }.into());
        }

        let target = decision.target();
        if let Some(prior) = prior {
            if booking.status == target {
                return Ok(Applied::AlreadyCommitted(prior.clone()));
            }
        }
        if !booking.status.can_transition_to(target) {
            return Err(BookingError::InvalidState {
                booking_id,
                current: booking.status,
                attempted: target,
            }
            .into());
        }

        if decision == Decision::Accept {
            let confirmed = tx.sum_confirmed_seats(offer.id, booking.id).await?;
            let available = offer.seat_capacity - confirmed;

            if booking.seats > available {
                return Err(BookingError::CapacityExceeded {
                    requested: booking.seats,
                    available: available.max(0),
                }
                .into());
            }
        }

        tx.set_status(booking.id, target).await?;

        let previous = booking.status;
        booking.update_status(target);

        Ok(Applied::Written(Outcome { booking, offer, previous }))
    }

    /// Best effort. The decision is already committed, so a failure here is only logged.
    async fn emit<E: Serialize>(&self, user_id: Uuid, kind: NotificationKind, event: &E) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {} notification: {}", kind.as_str(), e);
                return;
            }
        };

        let notification = Notification::new(user_id, kind, payload);
        if let Err(e) = self.notifier.enqueue(notification).await {
            warn!(
                "Failed to enqueue {} notification for {}: {}",
                kind.as_str(),
                user_id,
                e
            );
        }
    }
}

#[async_trait]
impl<L> BookingService for AcceptanceCoordinator<L>
where
    L: BookingLedger + 'static,
{
    async fn accept(&self, booking_id: Uuid, driver_id: Uuid) -> BookingResult<Booking> {
        let Outcome { booking, offer, .. } =
            self.decide(Decision::Accept, booking_id, driver_id).await?;

        info!(
            booking_id = %booking.id,
            offer_id = %offer.id,
            seats = booking.seats,
            "Booking accepted"
        );

        let event = BookingAcceptedEvent {
            booking_id: booking.id,
            offer_id: offer.id,
            driver_id: offer.driver_id,
            seats: booking.seats,
            timestamp: Utc::now().timestamp(),
        };
        self.emit(booking.passenger_id, NotificationKind::BookingAccepted, &event).await;

        Ok(booking)
    }

    async fn reject(&self, booking_id: Uuid, driver_id: Uuid) -> BookingResult<Booking> {
        let Outcome { booking, offer, .. } =
            self.decide(Decision::Reject, booking_id, driver_id).await?;

        info!("Booking rejected: {}", booking.id);

        let event = BookingRejectedEvent {
            booking_id: booking.id,
            offer_id: offer.id,
            driver_id: offer.driver_id,
            timestamp: Utc::now().timestamp(),
        };
        self.emit(booking.passenger_id, NotificationKind::BookingRejected, &event).await;

        Ok(booking)
    }

    async fn cancel(&self, booking_id: Uuid, passenger_id: Uuid) -> BookingResult<Booking> {
        let Outcome { booking, offer, previous } =
            self.decide(Decision::Cancel, booking_id, passenger_id).await?;

        let was_confirmed = previous == BookingStatus::Confirmed;
        info!("Booking cancelled: {} (released seats: {})", booking.id, was_confirmed);

        let event = BookingCancelledEvent {
            booking_id: booking.id,
            offer_id: offer.id,
            passenger_id: booking.passenger_id,
            seats: booking.seats,
            was_confirmed,
            timestamp: Utc::now().timestamp(),
        };
        self.emit(offer.driver_id, NotificationKind::BookingCancelled, &event).await;

        Ok(booking)
    }

    async fn available_seats(&self, offer_id: Uuid) -> BookingResult<SeatAvailability> {
        let offer = self
            .ledger
            .find_offer(offer_id)
            .await?
            .ok_or_else(|| LedgerError::offer_not_found(offer_id))?;
        let confirmed = self.ledger.confirmed_seats(offer_id).await?;

        Ok(SeatAvailability::new(offer.id, offer.seat_capacity, confirmed))
    }
}
