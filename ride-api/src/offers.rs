use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub offer_id: Uuid,
    pub capacity: i32,
    pub confirmed_seats: i32,
    pub available_seats: i32,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/offers/{id}/availability", get(get_availability))
}

async fn get_availability(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> Result<Json<AvailabilityResponse>, AppError> {
    let seats = state.bookings.available_seats(offer_id).await?;

    Ok(Json(AvailabilityResponse {
        offer_id: seats.offer_id,
        capacity: seats.capacity,
        confirmed_seats: seats.confirmed,
        available_seats: seats.available,
    }))
}
