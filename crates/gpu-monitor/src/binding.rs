//! Container to GPU binding resolution.
//!
//! A container's GPUs are taken from its `NVIDIA_VISIBLE_DEVICES` declaration
//! when it lists device UUIDs. Only when that yields nothing are the
//! container's explicit `/dev/nvidiaN` device mappings used.

use std::sync::Arc;
use std::sync::LazyLock;

use api_types::ContainerId;
use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;

use crate::error::MonitorError;
use crate::runtime::ContainerDevices;
use crate::runtime::ContainerInspector;
use crate::runtime::DeviceMapping;

/// Environment variable through which the NVIDIA container runtime exposes GPUs.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// Grants every GPU of the host. Never expected for monitored jobs.
const ALL_DEVICES: &str = "all";
/// Runtime values meaning "no GPU".
const NO_DEVICES: [&str; 2] = ["none", "void"];

static GPU_DEVICE_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/dev/nvidia([0-9]+)").expect("GPU device node pattern is valid")
});

/// The association between a container-visible device and a physical GPU.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DeviceBinding {
    /// From the container's host device mappings
    #[display("{host_path} -> {container_path}")]
    HostPath {
        host_path: String,
        container_path: String,
    },
    /// From the visible devices declaration
    #[display("{_0}")]
    Uuid(String),
}

impl DeviceBinding {
    /// Identifier of the device as seen from inside the container.
    pub fn container_key(&self) -> &str {
        match self {
            Self::HostPath { container_path, .. } => container_path,
            Self::Uuid(uuid) => uuid,
        }
    }

    /// Host index of a path binding, `N` of `/dev/nvidiaN`.
    pub fn host_index(&self) -> Option<u32> {
        match self {
            Self::HostPath { host_path, .. } => gpu_node_index(host_path),
            Self::Uuid(_) => None,
        }
    }
}

fn gpu_node_index(path: &str) -> Option<u32> {
    GPU_DEVICE_NODE
        .captures(path)
        .and_then(|captures| captures[1].parse().ok())
}

/// Maps containers to the GPUs assigned to them.
pub struct BindingResolver<I> {
    inspector: Arc<I>,
    visible_devices_env: String,
}

impl<I: ContainerInspector> BindingResolver<I> {
    pub fn new(inspector: Arc<I>, visible_devices_env: impl Into<String>) -> Self {
        Self {
            inspector,
            visible_devices_env: visible_devices_env.into(),
        }
    }

    /// Resolve the bindings of one container. An empty result means the
    /// container has no GPU.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Resolution`] if the runtime cannot inspect the container
    pub async fn resolve(
        &self,
        container_id: &ContainerId,
    ) -> Result<Vec<DeviceBinding>, Report<MonitorError>> {
        let devices = self
            .inspector
            .inspect(container_id)
            .await
            .change_context_lazy(|| MonitorError::Resolution {
                container_id: container_id.clone(),
            })?;
        Ok(bindings_for(&devices, &self.visible_devices_env))
    }
}

/// Derive the bindings of a container from its inspection metadata.
pub fn bindings_for(container: &ContainerDevices, visible_devices_env: &str) -> Vec<DeviceBinding> {
    let bindings = visible_device_bindings(&container.env, visible_devices_env);
    if !bindings.is_empty() {
        return bindings;
    }
    device_node_bindings(&container.devices)
}

fn visible_device_bindings(env: &[String], visible_devices_env: &str) -> Vec<DeviceBinding> {
    let Some(value) = env.iter().find_map(|definition| {
        definition
            .split_once('=')
            .filter(|(name, _)| *name == visible_devices_env)
            .map(|(_, value)| value)
    }) else {
        return Vec::new();
    };

    let mut entries: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();

    if let Some(position) = entries.iter().position(|entry| *entry == ALL_DEVICES) {
        // The scheduler limits jobs without GPUs to zero devices, so this
        // should not happen for a monitored container.
        tracing::warn!(
            "Ignoring all GPUs sentinel in {}={}, keeping only the devices listed before it",
            visible_devices_env,
            value
        );
        entries.truncate(position);
    }
    if entries.iter().any(|entry| NO_DEVICES.contains(entry)) {
        return Vec::new();
    }

    entries
        .into_iter()
        .map(|uuid| DeviceBinding::Uuid(uuid.to_string()))
        .collect()
}

fn device_node_bindings(devices: &[DeviceMapping]) -> Vec<DeviceBinding> {
    devices
        .iter()
        .filter(|mapping| GPU_DEVICE_NODE.is_match(&mapping.path_on_host))
        .map(|mapping| DeviceBinding::HostPath {
            host_path: mapping.path_on_host.clone(),
            container_path: mapping.path_in_container.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::MockInspector;

    fn mapping(host: &str, container: &str) -> DeviceMapping {
        DeviceMapping {
            path_on_host: host.to_string(),
            path_in_container: container.to_string(),
        }
    }

    fn container(env: &[&str], devices: Vec<DeviceMapping>) -> ContainerDevices {
        ContainerDevices {
            env: env.iter().map(|s| s.to_string()).collect(),
            devices,
        }
    }

    #[test]
    fn visible_devices_yield_uuid_bindings_in_order() {
        let info = container(
            &["PATH=/usr/bin", "NVIDIA_VISIBLE_DEVICES=GPU-b,GPU-a"],
            vec![mapping("/dev/nvidia3", "/dev/nvidia0")],
        );

        assert_eq!(
            bindings_for(&info, VISIBLE_DEVICES_ENV),
            vec![
                DeviceBinding::Uuid("GPU-b".to_string()),
                DeviceBinding::Uuid("GPU-a".to_string()),
            ]
        );
    }

    #[test]
    fn all_devices_sentinel_yields_nothing() {
        let info = container(&["NVIDIA_VISIBLE_DEVICES=all"], vec![]);
        assert!(bindings_for(&info, VISIBLE_DEVICES_ENV).is_empty());
    }

    #[test]
    fn all_devices_sentinel_ends_the_uuid_list() {
        let mixed = container(&["NVIDIA_VISIBLE_DEVICES=GPU-a, all ,GPU-b"], vec![]);
        assert_eq!(
            bindings_for(&mixed, VISIBLE_DEVICES_ENV),
            vec![DeviceBinding::Uuid("GPU-a".to_string())]
        );
    }

    #[test]
    fn all_devices_sentinel_falls_back_to_device_list() {
        let info = container(
            &["NVIDIA_VISIBLE_DEVICES=all"],
            vec![mapping("/dev/nvidia1", "/dev/nvidia0")],
        );
        assert_eq!(
            bindings_for(&info, VISIBLE_DEVICES_ENV),
            vec![DeviceBinding::HostPath {
                host_path: "/dev/nvidia1".to_string(),
                container_path: "/dev/nvidia0".to_string(),
            }]
        );
    }

    #[test]
    fn none_and_void_yield_nothing() {
        for value in ["none", "void", ""] {
            let definition = format!("NVIDIA_VISIBLE_DEVICES={value}");
            let info = container(&[definition.as_str()], vec![]);
            assert!(bindings_for(&info, VISIBLE_DEVICES_ENV).is_empty(), "{value}");
        }
    }

    #[test]
    fn device_list_keeps_only_gpu_nodes() {
        let info = container(
            &["HOME=/root"],
            vec![
                mapping("/dev/nvidiactl", "/dev/nvidiactl"),
                mapping("/dev/nvidia2", "/dev/nvidia0"),
                mapping("/dev/nvidia-uvm", "/dev/nvidia-uvm"),
                mapping("/dev/fuse", "/dev/fuse"),
                mapping("/dev/nvidia10", "/dev/nvidia1"),
            ],
        );

        let bindings = bindings_for(&info, VISIBLE_DEVICES_ENV);
        assert_eq!(
            bindings
                .iter()
                .map(DeviceBinding::container_key)
                .collect::<Vec<_>>(),
            vec!["/dev/nvidia0", "/dev/nvidia1"]
        );
        assert_eq!(
            bindings
                .iter()
                .map(DeviceBinding::host_index)
                .collect::<Vec<_>>(),
            vec![Some(2), Some(10)]
        );
    }

    #[test]
    fn no_assignment_yields_nothing() {
        assert!(bindings_for(&ContainerDevices::default(), VISIBLE_DEVICES_ENV).is_empty());
    }

    #[test]
    fn value_is_split_at_first_equals_and_trimmed() {
        let info = container(&["NVIDIA_VISIBLE_DEVICES= GPU-a=1 , ,GPU-b"], vec![]);
        assert_eq!(
            bindings_for(&info, VISIBLE_DEVICES_ENV),
            vec![
                DeviceBinding::Uuid("GPU-a=1".to_string()),
                DeviceBinding::Uuid("GPU-b".to_string()),
            ]
        );
    }

    #[test]
    fn custom_variable_name_is_honoured() {
        let info = container(&["NVIDIA_VISIBLE_DEVICES=GPU-a", "GPUS=GPU-z"], vec![]);
        assert_eq!(
            bindings_for(&info, "GPUS"),
            vec![DeviceBinding::Uuid("GPU-z".to_string())]
        );
    }

    #[test(tokio::test)]
    async fn resolve_surfaces_inspection_failure() {
        let inspector = Arc::new(MockInspector::new());
        let resolver = BindingResolver::new(inspector, VISIBLE_DEVICES_ENV);

        let err = resolver.resolve(&ContainerId::new("gone")).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            MonitorError::Resolution { container_id } if container_id.as_str() == "gone"
        ));
    }

    #[test(tokio::test)]
    async fn resolve_uses_inspected_metadata() {
        let inspector = Arc::new(MockInspector::new());
        inspector.insert_uuids("c1", &["GPU-abc"]);
        let resolver = BindingResolver::new(inspector, VISIBLE_DEVICES_ENV);

        let bindings = resolver.resolve(&ContainerId::new("c1")).await.unwrap();
        assert_eq!(bindings, vec![DeviceBinding::Uuid("GPU-abc".to_string())]);
    }
}
