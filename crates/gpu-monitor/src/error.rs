//! Errors surfaced by the monitoring core.

use core::error::Error;

use api_types::ContainerId;

/// Errors of the GPU statistics monitor.
#[derive(Debug, derive_more::Display)]
pub enum MonitorError {
    /// The telemetry backend could not be brought up; monitoring is unavailable.
    #[display("GPU telemetry is unavailable: {message}")]
    TelemetryUnavailable { message: String },
    /// Device bindings of a single container could not be resolved.
    #[display("Failed to resolve GPU bindings of container {container_id}")]
    Resolution { container_id: ContainerId },
    /// A binding refers to a device the catalog does not know.
    #[display("No GPU device matches binding {binding}")]
    UnknownDevice { binding: String },
    /// Statistics of one container could not be collected during a tick.
    #[display("Failed to sample GPU statistics of container {container_id}")]
    Stats { container_id: ContainerId },
}

impl Error for MonitorError {}
