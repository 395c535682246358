pub mod models;
pub mod redact;

pub use redact::Redacted;
