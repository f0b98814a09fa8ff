use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use api_types::JobStatsMessage;
use clap::Parser;
use gpu_monitor::config::Cli;
use gpu_monitor::config::Commands;
use gpu_monitor::config::MonitorConfig;
use gpu_monitor::config::WatchArgs;
use gpu_monitor::logging;
use gpu_monitor::runtime::docker::DockerInspector;
use gpu_monitor::telemetry::nvml::NvmlBackend;
use gpu_monitor::telemetry::TelemetryBackend;
use gpu_monitor::GpuStatsMonitor;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(watch_args) => run_watch(*watch_args).await,
        Commands::Devices => run_devices(),
    }
}

fn run_devices() -> Result<()> {
    utils::logging::init();

    let backend = NvmlBackend::init().map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let versions = backend.versions().map_err(|e| anyhow::anyhow!("{e:?}"))?;
    println!(
        "driver {} / NVML {} / CUDA driver {}",
        versions.driver, versions.nvml, versions.cuda_driver
    );

    for device in backend.devices().map_err(|e| anyhow::anyhow!("{e:?}"))? {
        println!(
            "{:<14} {:<42} {:<18} {}",
            device.path, device.uuid, device.bus_id, device.name
        );
    }
    Ok(())
}

async fn run_watch(watch_args: WatchArgs) -> Result<()> {
    let _guard = logging::init(watch_args.stats_file.as_deref())?;

    tracing::info!("Starting gpu-monitor {}", &**version::VERSION);

    let backend = Arc::new(NvmlBackend::init().map_err(|e| anyhow::anyhow!("{e:?}"))?);
    let inspector = Arc::new(DockerInspector::connect().map_err(|e| anyhow::anyhow!("{e:?}"))?);
    let (monitor, mut receiver) =
        GpuStatsMonitor::new(backend, inspector, MonitorConfig::from(&watch_args))
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("GPU monitoring is unavailable")?;
    tracing::info!("Monitoring {} GPU device(s)", monitor.catalog().len());

    let containers: Vec<_> = watch_args
        .containers
        .iter()
        .map(|pair| (pair.container_id.clone(), pair.job_id.clone()))
        .collect();
    let report = monitor
        .register_containers(&containers, watch_args.mode)
        .await;
    for (container_id, e) in &report.failed {
        tracing::error!("Cannot watch container {}: {e:?}", container_id);
    }
    if report.watched.is_empty() {
        tracing::warn!("None of the given containers uses a GPU, no samples will be produced");
    }

    let shutdown = shutdown_signal(watch_args.duration_secs.map(Duration::from_secs));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            message = receiver.recv() => match message {
                Some(message) => publish(&message)?,
                None => break,
            }
        }
    }

    monitor.stop().await;
    while let Ok(message) = receiver.try_recv() {
        publish(&message)?;
    }
    Ok(())
}

fn publish(message: &JobStatsMessage) -> Result<()> {
    let line = serde_json::to_string(message).context("failed to serialize GPU sample")?;
    tracing::info!(target: logging::STATS_TARGET, "{line}");
    println!("{line}");
    Ok(())
}

async fn shutdown_signal(duration: Option<Duration>) -> Result<()> {
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = deadline => {
                tracing::info!("Watch duration elapsed, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = deadline => {
                tracing::info!("Watch duration elapsed, shutting down");
            }
        }
    }
    Ok(())
}
