use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sent to the passenger once their booking is confirmed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingAcceptedEvent {
    pub booking_id: Uuid,
    pub offer_id: Uuid,
    pub driver_id: Uuid,
    pub seats: i32,
    pub timestamp: i64,
}

/// Sent to the passenger when the driver turns the request down.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingRejectedEvent {
    pub booking_id: Uuid,
    pub offer_id: Uuid,
    pub driver_id: Uuid,
    pub timestamp: i64,
}

/// Sent to the driver when a passenger withdraws. `was_confirmed` tells the driver
/// whether seats were released.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingCancelledEvent {
    pub booking_id: Uuid,
    pub offer_id: Uuid,
    pub passenger_id: Uuid,
    pub seats: i32,
    pub was_confirmed: bool,
    pub timestamp: i64,
}
