//! Immutable catalog of the physical GPUs of this host.

use std::collections::HashMap;

use error_stack::Report;
use error_stack::ResultExt;

use crate::error::MonitorError;
use crate::telemetry::Device;
use crate::telemetry::TelemetryBackend;

/// Devices enumerated once at startup, indexed by host path, host index and UUID.
///
/// The catalog is never mutated after construction and can be shared across
/// threads without locking.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
    by_path: HashMap<String, usize>,
    by_index: HashMap<u32, usize>,
    by_uuid: HashMap<String, usize>,
}

impl DeviceCatalog {
    /// Enumerate the devices of `backend`.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::TelemetryUnavailable`] if the backend cannot enumerate devices
    pub fn load<T: TelemetryBackend>(backend: &T) -> Result<Self, Report<MonitorError>> {
        let devices = backend
            .devices()
            .change_context(MonitorError::TelemetryUnavailable {
                message: "device enumeration failed".to_string(),
            })?;
        if devices.is_empty() {
            tracing::warn!("No GPU devices found, containers will not produce samples");
        }
        Ok(Self::from_devices(devices))
    }

    pub fn from_devices(devices: Vec<Device>) -> Self {
        let mut by_path = HashMap::with_capacity(devices.len());
        let mut by_index = HashMap::with_capacity(devices.len());
        let mut by_uuid = HashMap::with_capacity(devices.len());
        for (position, device) in devices.iter().enumerate() {
            by_path.insert(device.path.clone(), position);
            by_index.insert(device.index, position);
            by_uuid.insert(device.uuid.to_lowercase(), position);
        }
        Self {
            devices,
            by_path,
            by_index,
            by_uuid,
        }
    }

    pub fn list(&self) -> &[Device] {
        &self.devices
    }

    pub fn by_index(&self, index: u32) -> Option<&Device> {
        self.by_index.get(&index).map(|&i| &self.devices[i])
    }

    pub fn by_path(&self, path: &str) -> Option<&Device> {
        self.by_path.get(path).map(|&i| &self.devices[i])
    }

    /// Case-insensitive UUID lookup.
    pub fn by_uuid(&self, uuid: &str) -> Option<&Device> {
        self.by_uuid
            .get(&uuid.to_lowercase())
            .map(|&i| &self.devices[i])
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::test_device;
    use crate::mock::MockTelemetry;

    #[test]
    fn lookups_agree_on_device_identity() {
        let catalog = DeviceCatalog::from_devices(vec![
            test_device(0, "GPU-aaa"),
            test_device(1, "GPU-bbb"),
        ]);

        let by_uuid = catalog.by_uuid("GPU-bbb").unwrap();
        let by_index = catalog.by_index(1).unwrap();
        let by_path = catalog.by_path("/dev/nvidia1").unwrap();
        assert_eq!(by_uuid.handle, by_index.handle);
        assert_eq!(by_uuid.handle, by_path.handle);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn uuid_lookup_ignores_case() {
        let catalog = DeviceCatalog::from_devices(vec![test_device(3, "GPU-AbC")]);
        assert_eq!(catalog.by_uuid("gpu-abc").unwrap().index, 3);
        assert_eq!(catalog.by_uuid("GPU-ABC").unwrap().index, 3);
        assert!(catalog.by_uuid("GPU-other").is_none());
    }

    #[test]
    fn load_propagates_enumeration_failure() {
        let backend = MockTelemetry::new(vec![]);
        backend.fail_enumeration();

        let err = DeviceCatalog::load(&backend).unwrap_err();
        assert!(matches!(
            err.current_context(),
            MonitorError::TelemetryUnavailable { .. }
        ));
    }

    #[test]
    fn load_accepts_host_without_devices() {
        let backend = MockTelemetry::new(vec![]);
        let catalog = DeviceCatalog::load(&backend).unwrap();
        assert!(catalog.is_empty());
    }
}
