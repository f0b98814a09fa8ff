//! Test adapters implementing the capability traits
//!
//! This module provides in-memory implementations of [`TelemetryBackend`],
//! [`ContainerInspector`] and [`TimeSource`] for use in unit and integration
//! tests, where neither a GPU nor a container daemon is available.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::ContainerId;
use api_types::GpuStats;
use error_stack::Report;

use crate::runtime::ContainerDevices;
use crate::runtime::ContainerInspector;
use crate::runtime::DeviceMapping;
use crate::runtime::RuntimeError;
use crate::sampler::TimeSource;
use crate::telemetry::Device;
use crate::telemetry::DeviceHandle;
use crate::telemetry::TelemetryBackend;
use crate::telemetry::TelemetryError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A device at host index `index` with the given UUID.
pub fn test_device(index: u32, uuid: &str) -> Device {
    Device {
        index,
        path: Device::host_path(index),
        uuid: uuid.to_string(),
        bus_id: format!("00000000:{:02X}:00.0", index + 1),
        name: "Mock GPU".to_string(),
        handle: DeviceHandle::new(index),
    }
}

/// Mock telemetry backend serving synthetic statistics
#[derive(Default)]
pub struct MockTelemetry {
    devices: Vec<Device>,
    utilization: Mutex<HashMap<String, u32>>,
    failing: Mutex<HashSet<String>>,
    fail_enumeration: AtomicBool,
    panic_next_query: AtomicBool,
    queries: AtomicUsize,
}

impl MockTelemetry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    /// Make device enumeration fail, as if the driver were missing
    pub fn fail_enumeration(&self) {
        self.fail_enumeration.store(true, Ordering::SeqCst);
    }

    /// Make every statistics query of the device fail
    pub fn fail_device(&self, uuid: &str) {
        lock(&self.failing).insert(uuid.to_string());
    }

    pub fn recover_device(&self, uuid: &str) {
        lock(&self.failing).remove(uuid);
    }

    /// Panic inside the next statistics query, simulating a worker crash
    pub fn panic_on_next_query(&self) {
        self.panic_next_query.store(true, Ordering::SeqCst);
    }

    pub fn set_utilization(&self, uuid: &str, gpu_utilization: u32) {
        lock(&self.utilization).insert(uuid.to_string(), gpu_utilization);
    }

    /// Number of statistics queries served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// The record the backend returns for `device`
    pub fn expected_stats(&self, device: &Device) -> GpuStats {
        GpuStats {
            uuid: device.uuid.clone(),
            name: device.name.clone(),
            bus_id: device.bus_id.clone(),
            gpu_utilization: lock(&self.utilization)
                .get(&device.uuid)
                .copied()
                .unwrap_or(0),
            memory_total: 16 << 30,
            memory_used: 1 << 30,
            memory_free: 15 << 30,
            temperature: 40 + device.index,
            power_usage: Some(70_000),
            ..Default::default()
        }
    }
}

impl TelemetryBackend for MockTelemetry {
    fn devices(&self) -> Result<Vec<Device>, Report<TelemetryError>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(Report::new(TelemetryError::Init {
                message: "mock driver not loaded".to_string(),
            }));
        }
        Ok(self.devices.clone())
    }

    fn device_stats(&self, device: &Device) -> Result<GpuStats, Report<TelemetryError>> {
        if self.panic_next_query.swap(false, Ordering::SeqCst) {
            panic!("mock telemetry panic");
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing).contains(&device.uuid) {
            return Err(Report::new(TelemetryError::Query {
                device: device.uuid.clone(),
            }));
        }
        Ok(self.expected_stats(device))
    }
}

/// Mock container runtime serving preset inspection results
#[derive(Default)]
pub struct MockInspector {
    containers: Mutex<HashMap<ContainerId, ContainerDevices>>,
}

impl MockInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container_id: &str, devices: ContainerDevices) {
        lock(&self.containers).insert(ContainerId::new(container_id), devices);
    }

    /// A container declaring its GPUs through `NVIDIA_VISIBLE_DEVICES`
    pub fn insert_uuids(&self, container_id: &str, uuids: &[&str]) {
        self.insert(
            container_id,
            ContainerDevices {
                env: vec![format!("NVIDIA_VISIBLE_DEVICES={}", uuids.join(","))],
                devices: Vec::new(),
            },
        );
    }

    /// A container with explicit `(host, container)` device mappings
    pub fn insert_device_paths(&self, container_id: &str, paths: &[(&str, &str)]) {
        self.insert(
            container_id,
            ContainerDevices {
                env: Vec::new(),
                devices: paths
                    .iter()
                    .map(|(host, container)| DeviceMapping {
                        path_on_host: host.to_string(),
                        path_in_container: container.to_string(),
                    })
                    .collect(),
            },
        );
    }

    /// Forget a container, later inspections fail as if it were gone
    pub fn remove(&self, container_id: &str) {
        lock(&self.containers).remove(&ContainerId::new(container_id));
    }
}

impl ContainerInspector for MockInspector {
    async fn inspect(
        &self,
        container_id: &ContainerId,
    ) -> Result<ContainerDevices, Report<RuntimeError>> {
        lock(&self.containers)
            .get(container_id)
            .cloned()
            .ok_or_else(|| {
                Report::new(RuntimeError::Inspection {
                    container_id: container_id.clone(),
                })
            })
    }
}

/// Clock frozen at a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl TimeSource for FixedClock {
    fn now_unix_millis(&self) -> i64 {
        self.0
    }
}
