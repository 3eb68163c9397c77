pub mod config;
pub mod driver;
pub mod record;
pub mod runtime;
pub mod submission;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
