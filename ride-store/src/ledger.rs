use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ride_core::{
    Booking, BookingLedger, BookingStatus, LedgerError, LedgerTransaction, Offer, OfferStatus,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// SQLSTATE codes worth retrying the whole transaction for.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";

pub(crate) fn classify(err: sqlx::Error) -> LedgerError {
    let transient = match &err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE | QUERY_CANCELED)
        ),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    };

    if transient {
        LedgerError::Transient(err.to_string())
    } else {
        LedgerError::Storage(err.to_string())
    }
}

#[derive(sqlx::FromRow)]
struct OfferRow {
    id: Uuid,
    driver_id: Uuid,
    seats: i32,
    status: String,
}

impl TryFrom<OfferRow> for Offer {
    type Error = LedgerError;

    fn try_from(row: OfferRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OfferStatus>()
            .map_err(|e| LedgerError::Corrupt(format!("offer {}: {}", row.id, e)))?;

        Ok(Offer {
            id: row.id,
            driver_id: row.driver_id,
            seat_capacity: row.seats,
            status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    offer_id: Uuid,
    passenger_id: Uuid,
    seats: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = LedgerError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(|e| LedgerError::Corrupt(format!("booking {}: {}", row.id, e)))?;

        Ok(Booking {
            id: row.id,
            offer_id: row.offer_id,
            passenger_id: row.passenger_id,
            seats: row.seats,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed [`BookingLedger`].
///
/// Every transaction sets its own `lock_timeout` and `statement_timeout`, so a stuck
/// lock holder turns into a transient error for the waiters instead of blocking them.
#[derive(Clone)]
pub struct PgBookingLedger {
    pool: PgPool,
    lock_timeout: Duration,
    statement_timeout: Duration,
}

impl PgBookingLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(3),
            statement_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(mut self, lock_timeout: Duration, statement_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.statement_timeout = statement_timeout;
        self
    }
}

#[async_trait]
impl BookingLedger for PgBookingLedger {
    type Tx = PgLedgerTransaction;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // SET does not take bind parameters; both values are integers we own.
        let lock_timeout = self.lock_timeout.as_millis();
        let statement_timeout = self.statement_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL lock_timeout = {}", lock_timeout))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", statement_timeout))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        Ok(PgLedgerTransaction { tx })
    }

    async fn find_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, LedgerError> {
        let row = sqlx::query_as::<_, OfferRow>(
            "SELECT id, driver_id, seats, status FROM offers WHERE id = $1",
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(Offer::try_from).transpose()
    }

    async fn confirmed_seats(&self, offer_id: Uuid) -> Result<i32, LedgerError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(SUM(seats), 0)::INTEGER
            FROM bookings
            WHERE offer_id = $1 AND status = 'confirmed'
            "#,
        )
        .bind(offer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }
}

pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn lock_booking_and_offer(
        &mut self,
        booking_id: Uuid,
    ) -> Result<(Booking, Offer), LedgerError> {
        // A booking never moves to another offer, so reading offer_id unlocked is safe.
        let offer_id = sqlx::query_scalar::<_, Uuid>("SELECT offer_id FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .ok_or_else(|| LedgerError::booking_not_found(booking_id))?;

        // Offer first, then booking: the same order for every decision, so two
        // transactions can never hold one lock each while waiting on the other.
        let offer = sqlx::query_as::<_, OfferRow>(
            "SELECT id, driver_id, seats, status FROM offers WHERE id = $1 FOR UPDATE",
        )
        .bind(offer_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::offer_not_found(offer_id))?;

        let booking = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT id, offer_id, passenger_id, seats, status, created_at, updated_at
            FROM bookings
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::booking_not_found(booking_id))?;

        debug!("Locked offer {} and booking {}", offer_id, booking_id);

        Ok((Booking::try_from(booking)?, Offer::try_from(offer)?))
    }

    async fn sum_confirmed_seats(
        &mut self,
        offer_id: Uuid,
        excluding: Uuid,
    ) -> Result<i32, LedgerError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(SUM(seats), 0)::INTEGER
            FROM bookings
            WHERE offer_id = $1 AND status = 'confirmed' AND id <> $2
            "#,
        )
        .bind(offer_id)
        .bind(excluding)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn set_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE bookings SET status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(booking_id)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::booking_not_found(booking_id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx.rollback().await.map_err(classify)
    }
}
