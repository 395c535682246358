pub mod app_config;
pub mod database;
pub mod ledger;
pub mod notifications;

pub use database::DbClient;
pub use ledger::{PgBookingLedger, PgLedgerTransaction};
pub use notifications::PgNotificationSink;
#[cfg(feature = "kafka")]
pub use notifications::KafkaNotificationSink;
