//! Device telemetry capability.
//!
//! The monitoring core only needs two things from a telemetry backend: the
//! list of physical devices at startup and a fresh statistics record for a
//! given device. [`nvml::NvmlBackend`] provides both through NVML; tests use
//! [`crate::mock::MockTelemetry`].

pub mod nvml;

use core::error::Error;

use api_types::GpuStats;
use error_stack::Report;

/// Backend-specific handle used to address a device in statistics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// A physical GPU as enumerated at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Host index, the `N` of `/dev/nvidiaN`
    pub index: u32,
    /// Host device node
    pub path: String,
    pub uuid: String,
    pub bus_id: String,
    pub name: String,
    pub handle: DeviceHandle,
}

impl Device {
    /// Host device node of the device with the given index.
    pub fn host_path(index: u32) -> String {
        format!("/dev/nvidia{index}")
    }
}

/// Errors reported by telemetry backends.
#[derive(Debug, derive_more::Display)]
pub enum TelemetryError {
    #[display("Failed to initialize telemetry backend: {message}")]
    Init { message: String },
    #[display("Failed to enumerate GPU devices")]
    Enumeration,
    #[display("Failed to query statistics of GPU {device}")]
    Query { device: String },
}

impl Error for TelemetryError {}

/// Source of device enumeration and point-in-time device statistics.
pub trait TelemetryBackend: Send + Sync + 'static {
    /// Enumerate the physical devices of this host.
    fn devices(&self) -> Result<Vec<Device>, Report<TelemetryError>>;

    /// Query a fresh statistics record for `device`. May fail transiently.
    fn device_stats(&self, device: &Device) -> Result<GpuStats, Report<TelemetryError>>;
}
