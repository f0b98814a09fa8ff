use std::time::Duration;

use api_types::ContainerId;
use bollard::container::InspectContainerOptions;
use bollard::Docker;
use error_stack::Report;
use error_stack::ResultExt;

use super::ContainerDevices;
use super::ContainerInspector;
use super::DeviceMapping;
use super::RuntimeError;

const DOCKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Inspects containers through the local Docker daemon.
///
/// Honours `DOCKER_HOST`, falling back to the platform default socket.
pub struct DockerInspector {
    docker: Docker,
}

impl DockerInspector {
    pub fn connect() -> Result<Self, Report<RuntimeError>> {
        let docker = Docker::connect_with_local_defaults()
            .change_context(RuntimeError::Connection {
                message: "failed to create Docker client".to_string(),
            })?
            .with_timeout(DOCKER_TIMEOUT);
        Ok(Self { docker })
    }
}

impl ContainerInspector for DockerInspector {
    #[tracing::instrument(skip(self))]
    async fn inspect(
        &self,
        container_id: &ContainerId,
    ) -> Result<ContainerDevices, Report<RuntimeError>> {
        let response = self
            .docker
            .inspect_container(container_id.as_str(), None::<InspectContainerOptions>)
            .await
            .change_context_lazy(|| RuntimeError::Inspection {
                container_id: container_id.clone(),
            })?;

        let env = response
            .config
            .and_then(|config| config.env)
            .unwrap_or_default();
        let devices = response
            .host_config
            .and_then(|host_config| host_config.devices)
            .unwrap_or_default()
            .into_iter()
            .map(|mapping| DeviceMapping {
                path_on_host: mapping.path_on_host.unwrap_or_default(),
                path_in_container: mapping.path_in_container.unwrap_or_default(),
            })
            .collect();

        Ok(ContainerDevices { env, devices })
    }
}
