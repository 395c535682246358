use ride_booking::BookingService;
use ride_shared::Redacted;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: Redacted<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<dyn BookingService>,
    pub auth: AuthConfig,
}
