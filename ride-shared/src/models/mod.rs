pub mod events;

pub use events::{BookingAcceptedEvent, BookingCancelledEvent, BookingRejectedEvent};
