//! Background GPU statistics sampler.
//!
//! Once per interval the sampler copies the [`WatchRegistry`], queries the
//! telemetry backend for every watched device and publishes one
//! [`JobStatsMessage`] per container. Failures are contained per container:
//! a container whose device cannot be sampled is skipped for that tick while
//! every other container still gets its message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::ContainerId;
use api_types::JobStatsMessage;
use api_types::StatsSample;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;

use crate::binding::DeviceBinding;
use crate::device_catalog::DeviceCatalog;
use crate::error::MonitorError;
use crate::registry::WatchEntry;
use crate::registry::WatchRegistry;
use crate::telemetry::Device;
use crate::telemetry::TelemetryBackend;

/// Source of wall-clock time for sample timestamps
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch
    fn now_unix_millis(&self) -> i64;
}

/// Production system clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Lifecycle of a sampler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SamplerState {
    /// Not started yet
    Idle,
    Running,
    /// Terminal, either stopped on request or terminated abnormally
    Stopped,
}

/// Outcome of a single tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Samples handed to the output queue
    pub emitted: usize,
    pub failed: usize,
    /// Samples collected after the receiver was closed
    pub dropped: usize,
}

pub struct Sampler<T> {
    registry: Arc<WatchRegistry>,
    catalog: Arc<DeviceCatalog>,
    backend: Arc<T>,
    clock: Arc<dyn TimeSource>,
    output: mpsc::UnboundedSender<JobStatsMessage>,
    interval: Duration,
}

impl<T: TelemetryBackend> Sampler<T> {
    pub fn new(
        registry: Arc<WatchRegistry>,
        catalog: Arc<DeviceCatalog>,
        backend: Arc<T>,
        clock: Arc<dyn TimeSource>,
        output: mpsc::UnboundedSender<JobStatsMessage>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            backend,
            clock,
            output,
            interval,
        }
    }

    /// Spawn the sampling loop onto the current tokio runtime.
    pub fn start(self) -> SamplerHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));
        SamplerHandle {
            task,
            _cancel_on_drop: token.drop_guard(),
        }
    }

    async fn run(self, cancellation_token: CancellationToken) {
        tracing::info!("Start watching GPU statistics");
        // Cancellation is only observed between ticks, a started tick always completes
        while !cancellation_token.is_cancelled() {
            let summary = self.tick();
            tracing::debug!(
                emitted = summary.emitted,
                failed = summary.failed,
                dropped = summary.dropped,
                "GPU statistics tick completed"
            );

            tokio::select! {
                _ = cancellation_token.cancelled() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("Stopped watching GPU statistics");
    }

    /// Sample every watched container once.
    pub fn tick(&self) -> TickSummary {
        // The registry lock is released before any telemetry query
        let snapshot = self.registry.snapshot();

        let mut summary = TickSummary::default();
        for (container_id, entry) in &snapshot {
            match self.sample_container(container_id, entry) {
                Ok(sample) => {
                    let message = JobStatsMessage {
                        job_id: entry.job_id().clone(),
                        sample,
                    };
                    if self.output.send(message).is_ok() {
                        summary.emitted += 1;
                    } else {
                        tracing::debug!("GPU statistics receiver closed, dropping sample");
                        summary.dropped += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        container_id = %container_id,
                        job_id = %entry.job_id(),
                        "Failed to sample GPU statistics: {e:?}"
                    );
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn sample_container(
        &self,
        container_id: &ContainerId,
        entry: &WatchEntry,
    ) -> Result<StatsSample, Report<MonitorError>> {
        let stats_error = || MonitorError::Stats {
            container_id: container_id.clone(),
        };

        let mut gpus = BTreeMap::new();
        for binding in entry.bindings() {
            let device = self.device_for(binding).change_context_lazy(stats_error)?;
            let stats = self
                .backend
                .device_stats(device)
                .change_context_lazy(stats_error)?;
            gpus.insert(binding.container_key().to_string(), stats);
        }

        Ok(StatsSample {
            timestamp: self.clock.now_unix_millis(),
            gpus,
        })
    }

    fn device_for(&self, binding: &DeviceBinding) -> Result<&Device, Report<MonitorError>> {
        let device = match binding {
            DeviceBinding::Uuid(uuid) => self.catalog.by_uuid(uuid),
            DeviceBinding::HostPath { .. } => binding
                .host_index()
                .and_then(|index| self.catalog.by_index(index)),
        };
        device.ok_or_else(|| {
            Report::new(MonitorError::UnknownDevice {
                binding: binding.to_string(),
            })
        })
    }
}

/// Handle to a running sampler task. Dropping it stops the sampler.
pub struct SamplerHandle {
    task: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl SamplerHandle {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn state(&self) -> SamplerState {
        if self.is_alive() {
            SamplerState::Running
        } else {
            SamplerState::Stopped
        }
    }

    /// Request a stop and wait until the in-flight tick has completed.
    pub async fn shutdown(self) {
        let Self {
            task,
            _cancel_on_drop: cancel_on_drop,
        } = self;
        drop(cancel_on_drop);

        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!("GPU sampler terminated abnormally: {e}");
            }
        }
    }
}
