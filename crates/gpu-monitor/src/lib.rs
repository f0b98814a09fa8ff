//! GPU statistics of containers, attributed to the jobs that own them.
//!
//! [`GpuStatsMonitor`] resolves the GPUs of registered containers, keeps them
//! in a shared [`registry::WatchRegistry`] and runs a supervised
//! [`sampler::Sampler`] that publishes one [`api_types::JobStatsMessage`] per
//! container and tick onto an unbounded queue.

pub mod binding;
pub mod config;
pub mod device_catalog;
pub mod error;
pub mod logging;
pub mod mock;
pub mod registry;
pub mod runtime;
pub mod sampler;
pub mod supervisor;
pub mod telemetry;

pub use error::MonitorError;
pub use registry::RegistrationMode;
pub use supervisor::GpuStatsMonitor;
pub use supervisor::RegistrationReport;
pub use supervisor::StatsReceiver;
