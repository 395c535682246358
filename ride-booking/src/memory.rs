use async_trait::async_trait;
use chrono::Utc;
use ride_core::{Booking, BookingLedger, BookingStatus, LedgerError, LedgerTransaction, Offer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    offers: HashMap<Uuid, Offer>,
    bookings: HashMap<Uuid, Booking>,
}

#[derive(Default)]
struct Faults {
    lock_failures: AtomicUsize,
    commit_failures: AtomicUsize,
    lost_commit_acks: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Process-local ledger with the same locking contract as the Postgres one.
///
/// Each offer has its own async mutex standing in for the offer row lock; a transaction
/// holds it from `lock_booking_and_offer` until commit, rollback or drop. Writes are
/// buffered and become visible to other transactions only on commit, and rows are
/// re-read once the lock is granted, which is what `SELECT ... FOR UPDATE` does under
/// read committed.
#[derive(Clone)]
pub struct InMemoryLedger {
    tables: Arc<Mutex<Tables>>,
    row_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
    faults: Arc<Faults>,
    lock_timeout: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
            lock_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub async fn insert_offer(&self, offer: Offer) {
        self.tables.lock().await.offers.insert(offer.id, offer);
    }

    pub async fn insert_booking(&self, booking: Booking) {
        self.tables.lock().await.bookings.insert(booking.id, booking);
    }

    /// Changes an offer's capacity outside any booking decision, like the offer edit
    /// flow would.
    pub async fn set_capacity(&self, offer_id: Uuid, seat_capacity: i32) {
        if let Some(offer) = self.tables.lock().await.offers.get_mut(&offer_id) {
            offer.seat_capacity = seat_capacity;
        }
    }

    /// Last committed state of a booking.
    pub async fn booking(&self, booking_id: Uuid) -> Option<Booking> {
        self.tables.lock().await.bookings.get(&booking_id).cloned()
    }

    /// The next `n` lock attempts fail as if the lock wait timed out.
    pub fn fail_next_locks(&self, n: usize) {
        self.faults.lock_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits fail as if the connection dropped.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.commit_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits are applied, but the caller sees an error, as if the
    /// connection dropped before the acknowledgement arrived.
    pub fn lose_next_commit_acks(&self, n: usize) {
        self.faults.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    async fn row_lock(&self, offer_id: Uuid) -> Arc<Mutex<()>> {
        self.row_locks
            .lock()
            .await
            .entry(offer_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl BookingLedger for InMemoryLedger {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        Ok(InMemoryTransaction {
            ledger: self.clone(),
            held: Vec::new(),
            writes: HashMap::new(),
        })
    }

    async fn find_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, LedgerError> {
        Ok(self.tables.lock().await.offers.get(&offer_id).cloned())
    }

    async fn confirmed_seats(&self, offer_id: Uuid) -> Result<i32, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .bookings
            .values()
            .filter(|b| b.offer_id == offer_id && b.status == BookingStatus::Confirmed)
            .map(|b| b.seats)
            .sum())
    }
}

pub struct InMemoryTransaction {
    ledger: InMemoryLedger,
    held: Vec<OwnedMutexGuard<()>>,
    writes: HashMap<Uuid, BookingStatus>,
}

impl InMemoryTransaction {
    /// Committed row with this transaction's own uncommitted writes applied.
    fn visible(&self, booking: &Booking) -> Booking {
        let mut booking = booking.clone();
        if let Some(status) = self.writes.get(&booking.id) {
            booking.status = *status;
        }
        booking
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    async fn lock_booking_and_offer(
        &mut self,
        booking_id: Uuid,
    ) -> Result<(Booking, Offer), LedgerError> {
        if Faults::take(&self.ledger.faults.lock_failures) {
            return Err(LedgerError::Transient("lock wait timeout (injected)".into()));
        }

        let offer_id = self
            .ledger
            .tables
            .lock()
            .await
            .bookings
            .get(&booking_id)
            .map(|b| b.offer_id)
            .ok_or_else(|| LedgerError::booking_not_found(booking_id))?;

        let lock = self.ledger.row_lock(offer_id).await;
        let guard = tokio::time::timeout(self.ledger.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                LedgerError::Transient(format!("lock wait timeout on offer {}", offer_id))
            })?;
        self.held.push(guard);

        let tables = self.ledger.tables.lock().await;
        let booking = tables
            .bookings
            .get(&booking_id)
            .map(|b| self.visible(b))
            .ok_or_else(|| LedgerError::booking_not_found(booking_id))?;
        let offer = tables
            .offers
            .get(&offer_id)
            .cloned()
            .ok_or_else(|| LedgerError::offer_not_found(offer_id))?;

        Ok((booking, offer))
    }

    async fn sum_confirmed_seats(
        &mut self,
        offer_id: Uuid,
        excluding: Uuid,
    ) -> Result<i32, LedgerError> {
        let tables = self.ledger.tables.lock().await;
        Ok(tables
            .bookings
            .values()
            .filter(|b| b.offer_id == offer_id && b.id != excluding)
            .map(|b| self.visible(b))
            .filter(|b| b.status == BookingStatus::Confirmed)
            .map(|b| b.seats)
            .sum())
    }

    async fn set_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<(), LedgerError> {
        if !self.ledger.tables.lock().await.bookings.contains_key(&booking_id) {
            return Err(LedgerError::booking_not_found(booking_id));
        }
        self.writes.insert(booking_id, status);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), LedgerError> {
        if Faults::take(&self.ledger.faults.commit_failures) {
            return Err(LedgerError::Transient("connection reset during commit (injected)".into()));
        }

        let mut tables = self.ledger.tables.lock().await;
        let now = Utc::now();
        for (booking_id, status) in self.writes.drain() {
            if let Some(booking) = tables.bookings.get_mut(&booking_id) {
                booking.status = status;
                booking.updated_at = now;
            }
        }
        drop(tables);
        self.held.clear();

        if Faults::take(&self.ledger.faults.lost_commit_acks) {
            return Err(LedgerError::Transient("connection reset after commit (injected)".into()));
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        Ok(())
    }
}
