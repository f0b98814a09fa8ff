//! Registration API and sampler supervision.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::ContainerId;
use api_types::JobId;
use api_types::JobStatsMessage;
use error_stack::Report;
use tokio::sync::mpsc;

use crate::binding::BindingResolver;
use crate::config::MonitorConfig;
use crate::device_catalog::DeviceCatalog;
use crate::error::MonitorError;
use crate::registry::RegistrationMode;
use crate::registry::WatchEntry;
use crate::registry::WatchRegistry;
use crate::registry::WatchSnapshot;
use crate::runtime::ContainerInspector;
use crate::sampler::Sampler;
use crate::sampler::SamplerHandle;
use crate::sampler::SamplerState;
use crate::sampler::SystemClock;
use crate::sampler::TimeSource;
use crate::telemetry::TelemetryBackend;

/// Receiving end of the sample queue.
///
/// The queue is unbounded: the sampler never waits for a consumer, a consumer
/// that stops draining makes it grow without limit.
pub type StatsReceiver = mpsc::UnboundedReceiver<JobStatsMessage>;

/// Per-container outcome of a registration call.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    /// Containers now being watched
    pub watched: Vec<ContainerId>,
    /// Containers without any GPU, left unwatched
    pub without_gpus: Vec<ContainerId>,
    /// Containers whose GPUs could not be resolved
    pub failed: Vec<(ContainerId, Report<MonitorError>)>,
}

impl RegistrationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum SamplerSlot {
    Idle,
    Running(SamplerHandle),
    Stopped,
}

/// GPU statistics monitor of a set of containers.
///
/// Owns the watch registry and keeps exactly one live [`Sampler`] publishing
/// into the output queue, respawning it on the next registration call if it
/// terminated.
pub struct GpuStatsMonitor<T, I> {
    registry: Arc<WatchRegistry>,
    catalog: Arc<DeviceCatalog>,
    backend: Arc<T>,
    resolver: BindingResolver<I>,
    clock: Arc<dyn TimeSource>,
    output: mpsc::UnboundedSender<JobStatsMessage>,
    config: MonitorConfig,
    sampler: Mutex<SamplerSlot>,
}

impl<T: TelemetryBackend, I: ContainerInspector> GpuStatsMonitor<T, I> {
    /// Build the device catalog and the output queue. No sampler runs until
    /// [`start`](Self::start) or the first registration.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::TelemetryUnavailable`] if the GPUs cannot be enumerated
    pub fn new(
        backend: Arc<T>,
        inspector: Arc<I>,
        config: MonitorConfig,
    ) -> Result<(Self, StatsReceiver), Report<MonitorError>> {
        let catalog = Arc::new(DeviceCatalog::load(backend.as_ref())?);
        let (output, receiver) = mpsc::unbounded_channel();
        let monitor = Self {
            registry: Arc::new(WatchRegistry::new()),
            catalog,
            backend,
            resolver: BindingResolver::new(inspector, config.visible_devices_env.clone()),
            clock: Arc::new(SystemClock),
            output,
            config,
            sampler: Mutex::new(SamplerSlot::Idle),
        };
        Ok((monitor, receiver))
    }

    /// Replace the wall clock used for sample timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    fn slot(&self) -> MutexGuard<'_, SamplerSlot> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a live sampler exists. Returns `true` if one was spawned.
    pub fn start(&self) -> bool {
        let mut slot = self.slot();
        match &*slot {
            SamplerSlot::Running(handle) if handle.is_alive() => return false,
            SamplerSlot::Running(_) => {
                tracing::error!("GPU sampler not running. Restarting...");
            }
            SamplerSlot::Idle | SamplerSlot::Stopped => {}
        }

        let sampler = Sampler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.catalog),
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.output.clone(),
            self.config.sample_interval,
        );
        *slot = SamplerSlot::Running(sampler.start());
        true
    }

    /// Stop the sampler, waiting for its in-flight tick to finish.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.slot(), SamplerSlot::Stopped);
        if let SamplerSlot::Running(handle) = previous {
            handle.shutdown().await;
        }
    }

    pub fn sampler_state(&self) -> SamplerState {
        match &*self.slot() {
            SamplerSlot::Idle => SamplerState::Idle,
            SamplerSlot::Running(handle) => handle.state(),
            SamplerSlot::Stopped => SamplerState::Stopped,
        }
    }

    /// Watch the GPUs of the given containers, attributing samples to their job.
    ///
    /// Containers are resolved concurrently; a container that cannot be
    /// inspected is reported in [`RegistrationReport::failed`] without
    /// affecting the rest of the batch. The resolved batch is applied to the
    /// registry atomically according to `mode`. A failed container that is
    /// already watched keeps its current entry, even under
    /// [`RegistrationMode::Replace`].
    #[tracing::instrument(skip(self, containers), fields(count = containers.len()))]
    pub async fn register_containers(
        &self,
        containers: &[(ContainerId, JobId)],
        mode: RegistrationMode,
    ) -> RegistrationReport {
        self.start();

        let resolutions =
            futures::future::join_all(containers.iter().map(|(container_id, job_id)| async move {
                (container_id, job_id, self.resolver.resolve(container_id).await)
            }))
            .await;

        let mut report = RegistrationReport::default();
        let mut batch = WatchSnapshot::new();
        for (container_id, job_id, resolution) in resolutions {
            match resolution {
                Ok(bindings) => match WatchEntry::new(job_id.clone(), bindings) {
                    Some(entry) => {
                        tracing::info!("Monitoring GPU stats for container: {}", container_id);
                        batch.insert(container_id.clone(), entry);
                        report.watched.push(container_id.clone());
                    }
                    None => {
                        tracing::debug!("Container {} has no GPU, not watching it", container_id);
                        report.without_gpus.push(container_id.clone());
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        container_id = %container_id,
                        "Failed to resolve GPU bindings: {e:?}"
                    );
                    report.failed.push((container_id.clone(), e));
                }
            }
        }

        let retained: Vec<ContainerId> = report
            .failed
            .iter()
            .map(|(container_id, _)| container_id.clone())
            .collect();
        self.registry.apply(batch, mode, &retained);
        report
    }

    /// Stop watching the given containers, returning the ones that were watched.
    pub fn unregister_containers(&self, container_ids: &[ContainerId]) -> Vec<ContainerId> {
        let removed = self.registry.unregister(container_ids);
        for container_id in &removed {
            tracing::info!("Stopped monitoring GPU stats for container: {}", container_id);
        }
        removed
    }

    /// A consistent copy of the watched containers.
    pub fn watched(&self) -> WatchSnapshot {
        self.registry.snapshot()
    }
}
