use async_trait::async_trait;
use ride_booking::{AcceptanceCoordinator, BookingService, InMemoryLedger, RetryPolicy};
use ride_core::{
    Booking, BookingError, BookingLedger, BookingStatus, LedgerTransaction, Notification,
    NotificationKind, NotificationSink, NotifyError, Offer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

struct BrokenSink;

#[async_trait]
impl NotificationSink for BrokenSink {
    async fn enqueue(&self, _notification: Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("broker unreachable".into()))
    }
}

struct Fixture {
    ledger: Arc<InMemoryLedger>,
    sink: Arc<RecordingSink>,
    coordinator: Arc<AcceptanceCoordinator<InMemoryLedger>>,
    offer: Offer,
    bookings: Vec<Booking>,
}

impl Fixture {
    async fn new(capacity: i32, seats: &[i32]) -> Self {
        Self::with_ledger(InMemoryLedger::new(), capacity, seats).await
    }

    async fn with_ledger(ledger: InMemoryLedger, capacity: i32, seats: &[i32]) -> Self {
        let ledger = Arc::new(ledger);
        let offer = Offer::new(Uuid::new_v4(), capacity);
        ledger.insert_offer(offer.clone()).await;

        let mut bookings = Vec::new();
        for &n in seats {
            let booking = Booking::new(offer.id, Uuid::new_v4(), n);
            ledger.insert_booking(booking.clone()).await;
            bookings.push(booking);
        }

        let sink = Arc::new(RecordingSink::default());
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let coordinator = Arc::new(
            AcceptanceCoordinator::new(ledger.clone(), sink.clone()).with_retry_policy(retry),
        );

        Self { ledger, sink, coordinator, offer, bookings }
    }

    fn driver(&self) -> Uuid {
        self.offer.driver_id
    }

    async fn status(&self, index: usize) -> BookingStatus {
        self.ledger.booking(self.bookings[index].id).await.unwrap().status
    }

    async fn confirmed(&self) -> i32 {
        self.ledger.confirmed_seats(self.offer.id).await.unwrap()
    }
}

#[tokio::test]
async fn test_second_booking_exceeds_remaining_capacity() {
    let fx = Fixture::new(4, &[2, 3]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    assert_eq!(fx.confirmed().await, 2);

    let err = fx.coordinator.accept(fx.bookings[1].id, fx.driver()).await.unwrap_err();
    assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    assert_eq!(err.available_seats(), Some(2));
    assert_eq!(fx.status(1).await, BookingStatus::Pending);
    assert_eq!(fx.confirmed().await, 2);
}

#[tokio::test]
async fn test_offer_fills_up_exactly() {
    let fx = Fixture::new(3, &[2, 1]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    fx.coordinator.accept(fx.bookings[1].id, fx.driver()).await.unwrap();

    assert_eq!(fx.confirmed().await, 3);
    let availability = fx.coordinator.available_seats(fx.offer.id).await.unwrap();
    assert_eq!(availability.available, 0);
    assert_eq!(availability.capacity, 3);
}

#[tokio::test]
async fn test_boundary_one_seat_over() {
    let fx = Fixture::new(5, &[2, 3, 4]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();

    // 3 remaining: asking for 4 fails, asking for exactly 3 succeeds.
    let err = fx.coordinator.accept(fx.bookings[2].id, fx.driver()).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::CapacityExceeded { requested: 4, available: 3 }
    ));
    fx.coordinator.accept(fx.bookings[1].id, fx.driver()).await.unwrap();
    assert_eq!(fx.confirmed().await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_never_overbook() {
    let fx = Fixture::new(4, &[2, 2, 2]).await;

    let handles: Vec<_> = fx
        .bookings
        .iter()
        .map(|booking| {
            let coordinator = fx.coordinator.clone();
            let booking_id = booking.id;
            let driver = fx.driver();
            tokio::spawn(async move { coordinator.accept(booking_id, driver).await })
        })
        .collect();

    let mut accepted = 0;
    let mut refused = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => refused.push(e),
        }
    }

    assert_eq!(accepted, 2);
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].code(), "CAPACITY_EXCEEDED");
    assert_eq!(refused[0].available_seats(), Some(0));
    assert_eq!(fx.confirmed().await, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_racing_accepts_respect_capacity() {
    let seats = [1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3];
    let fx = Fixture::new(7, &seats).await;

    let handles: Vec<_> = fx
        .bookings
        .iter()
        .map(|booking| {
            let coordinator = fx.coordinator.clone();
            let booking_id = booking.id;
            let driver = fx.driver();
            tokio::spawn(async move { coordinator.accept(booking_id, driver).await })
        })
        .collect();

    let mut accepted_seats = 0;
    for handle in handles {
        if let Ok(booking) = handle.await.unwrap() {
            accepted_seats += booking.seats;
        }
    }

    let confirmed = fx.confirmed().await;
    assert!(confirmed <= 7);
    assert_eq!(confirmed, accepted_seats);
}

#[tokio::test]
async fn test_non_driver_is_forbidden() {
    let fx = Fixture::new(4, &[2]).await;

    let err = fx.coordinator.accept(fx.bookings[0].id, Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(fx.status(0).await, BookingStatus::Pending);

    // The passenger cannot confirm their own booking either.
    let err = fx
        .coordinator
        .accept(fx.bookings[0].id, fx.bookings[0].passenger_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn test_second_accept_is_invalid_state() {
    let fx = Fixture::new(4, &[2]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    let err = fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap_err();

    assert_eq!(err.code(), "INVALID_STATE");
    assert_eq!(err.current_status(), Some(BookingStatus::Confirmed));
    assert_eq!(fx.confirmed().await, 2);
    assert_eq!(fx.sink.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_booking_is_not_found() {
    let fx = Fixture::new(4, &[]).await;

    let err = fx.coordinator.accept(Uuid::new_v4(), fx.driver()).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_passenger_is_notified_after_accept() {
    let fx = Fixture::new(4, &[2]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();

    let sent = fx.sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, fx.bookings[0].passenger_id);
    assert_eq!(sent[0].kind, NotificationKind::BookingAccepted);
    assert_eq!(sent[0].payload["bookingId"], fx.bookings[0].id.to_string());
    assert_eq!(sent[0].payload["seats"], 2);
}

#[tokio::test]
async fn test_refused_accept_sends_nothing() {
    let fx = Fixture::new(1, &[2]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap_err();
    assert!(fx.sink.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_driver_is_notified_of_cancellation() {
    let fx = Fixture::new(4, &[2]).await;

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    fx.coordinator
        .cancel(fx.bookings[0].id, fx.bookings[0].passenger_id)
        .await
        .unwrap();

    let sent = fx.sink.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].user_id, fx.driver());
    assert_eq!(sent[1].kind, NotificationKind::BookingCancelled);
    assert_eq!(sent[1].payload["wasConfirmed"], true);
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_accept() {
    let ledger = Arc::new(InMemoryLedger::new());
    let offer = Offer::new(Uuid::new_v4(), 2);
    let booking = Booking::new(offer.id, Uuid::new_v4(), 2);
    ledger.insert_offer(offer.clone()).await;
    ledger.insert_booking(booking.clone()).await;

    let coordinator = AcceptanceCoordinator::new(ledger.clone(), Arc::new(BrokenSink));

    let accepted = coordinator.accept(booking.id, offer.driver_id).await.unwrap();
    assert_eq!(accepted.status, BookingStatus::Confirmed);
    assert_eq!(ledger.booking(booking.id).await.unwrap().status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_transient_lock_failure_is_retried() {
    let fx = Fixture::new(4, &[2]).await;
    fx.ledger.fail_next_locks(2);

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    assert_eq!(fx.status(0).await, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_failed_commit_is_retried_from_scratch() {
    let fx = Fixture::new(4, &[2]).await;
    fx.ledger.fail_next_commits(1);

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    assert_eq!(fx.confirmed().await, 2);
}

#[tokio::test]
async fn test_accept_whose_commit_ack_was_lost_succeeds() {
    let fx = Fixture::new(4, &[2]).await;
    fx.ledger.lose_next_commit_acks(1);

    let booking = fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(fx.confirmed().await, 2);

    let sent = fx.sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, fx.bookings[0].passenger_id);
    assert_eq!(sent[0].kind, NotificationKind::BookingAccepted);
}

#[tokio::test]
async fn test_cancel_whose_commit_ack_was_lost_reports_freed_seats() {
    let fx = Fixture::new(4, &[2]).await;
    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    fx.ledger.lose_next_commit_acks(1);

    let booking = fx
        .coordinator
        .cancel(fx.bookings[0].id, fx.bookings[0].passenger_id)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(fx.confirmed().await, 0);

    let sent = fx.sink.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, NotificationKind::BookingCancelled);
    assert_eq!(sent[1].payload["wasConfirmed"], true);
}

#[tokio::test]
async fn test_lost_ack_does_not_hide_a_real_double_accept() {
    let fx = Fixture::new(4, &[2]).await;
    fx.ledger.lose_next_commit_acks(1);

    fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap();
    let err = fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn test_exhausted_retries_surface_unavailable() {
    let fx = Fixture::new(4, &[2]).await;
    fx.ledger.fail_next_commits(3);

    let err = fx.coordinator.accept(fx.bookings[0].id, fx.driver()).await.unwrap_err();
    assert_eq!(err.code(), "UNAVAILABLE");
    assert_eq!(fx.status(0).await, BookingStatus::Pending);
    assert!(fx.sink.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_stuck_lock_holder_yields_unavailable() {
    let ledger = InMemoryLedger::new().with_lock_timeout(Duration::from_millis(20));
    let fx = Fixture::with_ledger(ledger, 4, &[2, 2]).await;

    // Another transaction sits on the offer lock for the whole test.
    let mut holder = fx.ledger.begin().await.unwrap();
    holder.lock_booking_and_offer(fx.bookings[0].id).await.unwrap();

    let err = fx.coordinator.accept(fx.bookings[1].id, fx.driver()).await.unwrap_err();
    assert_eq!(err.code(), "UNAVAILABLE");

    holder.rollback().await.unwrap();
    fx.coordinator.accept(fx.bookings[1].id, fx.driver()).await.unwrap();
}

#[tokio::test]
async fn test_other_offers_are_not_blocked() {
    let ledger = InMemoryLedger::new().with_lock_timeout(Duration::from_millis(20));
    let fx = Fixture::with_ledger(ledger, 4, &[2]).await;

    let other_offer = Offer::new(Uuid::new_v4(), 2);
    let other_booking = Booking::new(other_offer.id, Uuid::new_v4(), 2);
    fx.ledger.insert_offer(other_offer.clone()).await;
    fx.ledger.insert_booking(other_booking.clone()).await;

    let mut holder = fx.ledger.begin().await.unwrap();
    holder.lock_booking_and_offer(fx.bookings[0].id).await.unwrap();

    fx.coordinator
        .accept(other_booking.id, other_offer.driver_id)
        .await
        .unwrap();
}
