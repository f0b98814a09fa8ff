pub mod cli;
pub mod watch;

use std::time::Duration;

use crate::binding::VISIBLE_DEVICES_ENV;

pub use cli::*;
pub use watch::*;

/// Runtime parameters of the monitoring core.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between two sampler ticks
    pub sample_interval: Duration,
    /// Environment variable declaring the GPUs of a container
    pub visible_devices_env: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            visible_devices_env: VISIBLE_DEVICES_ENV.to_string(),
        }
    }
}

impl From<&WatchArgs> for MonitorConfig {
    fn from(args: &WatchArgs) -> Self {
        Self {
            sample_interval: Duration::from_millis(args.interval_ms.max(1)),
            visible_devices_env: args.visible_devices_env.clone(),
        }
    }
}
