//! Container runtime inspection capability.

pub mod docker;

use core::error::Error;
use std::future::Future;

use api_types::ContainerId;
use error_stack::Report;

/// An explicit host device mapping of a container (`docker run --device`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
}

/// The device assignment metadata of a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerDevices {
    /// Declared environment, one `KEY=VALUE` string per variable
    pub env: Vec<String>,
    /// Host device mappings in the order the runtime reports them
    pub devices: Vec<DeviceMapping>,
}

/// Errors reported by container runtimes.
#[derive(Debug, derive_more::Display)]
pub enum RuntimeError {
    #[display("Failed to connect to container runtime: {message}")]
    Connection { message: String },
    #[display("Failed to inspect container {container_id}")]
    Inspection { container_id: ContainerId },
}

impl Error for RuntimeError {}

/// Looks up the device assignment of a container.
pub trait ContainerInspector: Send + Sync + 'static {
    fn inspect(
        &self,
        container_id: &ContainerId,
    ) -> impl Future<Output = Result<ContainerDevices, Report<RuntimeError>>> + Send;
}
