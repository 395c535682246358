use axum::{
    extract::{Path, State},
    routing::post,
    Extension, Json, Router,
};
use ride_core::{Booking, BookingStatus};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{error::AppError, middleware::Caller, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub ok: bool,
    pub booking_id: Uuid,
    pub status: BookingStatus,
}

impl From<Booking> for DecisionResponse {
    fn from(booking: Booking) -> Self {
        Self {
            ok: true,
            booking_id: booking.id,
            status: booking.status,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings/{id}/accept", post(accept_booking))
        .route("/v1/bookings/{id}/reject", post(reject_booking))
        .route("/v1/bookings/{id}/cancel", post(cancel_booking))
}

async fn accept_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<DecisionResponse>, AppError> {
    info!("Driver {} accepting booking {}", caller.user_id, booking_id);
    let booking = state.bookings.accept(booking_id, caller.user_id).await?;
    Ok(Json(booking.into()))
}

async fn reject_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<DecisionResponse>, AppError> {
    info!("Driver {} rejecting booking {}", caller.user_id, booking_id);
    let booking = state.bookings.reject(booking_id, caller.user_id).await?;
    Ok(Json(booking.into()))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<DecisionResponse>, AppError> {
    info!("Passenger {} cancelling booking {}", caller.user_id, booking_id);
    let booking = state.bookings.cancel(booking_id, caller.user_id).await?;
    Ok(Json(booking.into()))
}
