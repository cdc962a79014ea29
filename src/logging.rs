//! Process-wide log output.
//!
//! The library crates log through the `log` facade; this installs a
//! `tracing-subscriber` formatter with the `log` bridge so those records
//! reach it.

use crate::settings::{LogFormat, Settings};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "STACKPILOT_LOG";

/// Install the global subscriber.
///
/// The filter comes from `STACKPILOT_LOG`, then `level`, then `info`.
/// Returns false when a subscriber was already installed.
pub fn init(level: Option<&str>, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

/// Install the global subscriber from `settings.log_level` and
/// `settings.log_format`.
pub fn init_from_settings(settings: &Settings) -> bool {
    init(Some(&settings.log_level), settings.log_format)
}
