//! Shared API type definitions
//!
//! This crate contains the data types that leave the gpu-monitor process:
//! container and job identifiers, the per-device statistics record and the
//! per-job sample messages published on the output queue.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Identifier of a container as understood by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of the logical job that owns one or more containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Point-in-time statistics of a single GPU
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuStats {
    /// Device UUID, e.g. `GPU-5d8a...`
    pub uuid: String,
    /// Marketing name of the device
    pub name: String,
    /// PCI bus id
    pub bus_id: String,
    /// GPU utilization in percent over the last sample period
    pub gpu_utilization: u32,
    /// Memory controller utilization in percent
    pub memory_utilization: u32,
    /// Encoder utilization in percent
    pub encoder_utilization: u32,
    /// Decoder utilization in percent
    pub decoder_utilization: u32,
    /// Framebuffer memory in bytes
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    /// Degrees Celsius
    pub temperature: u32,
    /// Milliwatts, absent when the board does not report power
    pub power_usage: Option<u32>,
    /// Percent of maximum fan speed, absent on passively cooled boards
    pub fan_speed: Option<u32>,
    // MHz
    pub graphics_clock: u32,
    pub sm_clock: u32,
    pub memory_clock: u32,
    // PCIe KB/s
    pub pcie_rx: u32,
    pub pcie_tx: u32,
}

/// Statistics of all GPUs of one container, keyed by the container-local
/// device identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp: i64,
    pub gpus: BTreeMap<String, GpuStats>,
}

/// The unit published on the output queue: one sample attributed to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatsMessage {
    pub job_id: JobId,
    #[serde(flatten)]
    pub sample: StatsSample,
}
