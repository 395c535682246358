pub mod coordinator;
pub mod memory;
pub mod notify;
pub mod retry;

pub use coordinator::{AcceptanceCoordinator, BookingService};
pub use memory::InMemoryLedger;
pub use notify::{LogNotificationSink, NotificationQueue};
pub use retry::RetryPolicy;
