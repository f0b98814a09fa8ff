use std::path::PathBuf;
use std::str::FromStr;

use api_types::ContainerId;
use api_types::JobId;
use clap::Parser;

use crate::binding::VISIBLE_DEVICES_ENV;
use crate::registry::RegistrationMode;

/// A `<CONTAINER>=<JOB>` command line pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerJob {
    pub container_id: ContainerId,
    pub job_id: JobId,
}

impl FromStr for ContainerJob {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((container, job)) if !container.is_empty() && !job.is_empty() => Ok(Self {
                container_id: ContainerId::new(container),
                job_id: JobId::new(job),
            }),
            _ => Err(format!("expected <CONTAINER>=<JOB>, got '{s}'")),
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct WatchArgs {
    #[arg(
        long = "container",
        short = 'c',
        required = true,
        value_name = "CONTAINER=JOB",
        help = "Container to watch and the job its samples are attributed to, repeatable"
    )]
    pub containers: Vec<ContainerJob>,

    #[arg(
        long,
        value_enum,
        default_value = "replace",
        help = "How the containers are applied to the watch list"
    )]
    pub mode: RegistrationMode,

    #[arg(
        long,
        env = "GPU_MONITOR_INTERVAL_MS",
        default_value = "1000",
        help = "Sampling interval in milliseconds"
    )]
    pub interval_ms: u64,

    #[arg(
        long,
        env = "GPU_MONITOR_VISIBLE_DEVICES_ENV",
        default_value = VISIBLE_DEVICES_ENV,
        help = "Container environment variable listing the GPU UUIDs of a container"
    )]
    pub visible_devices_env: String,

    #[arg(
        long,
        env = "GPU_MONITOR_STATS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also append samples as JSON lines to this daily rotated file, e.g. /logs/gpu-stats.log"
    )]
    pub stats_file: Option<PathBuf>,

    #[arg(long, help = "Stop after this many seconds instead of waiting for a signal")]
    pub duration_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;
    use crate::config::MonitorConfig;

    #[test]
    fn container_job_pair_parses() {
        let pair: ContainerJob = "abc123=train-7".parse().unwrap();
        assert_eq!(pair.container_id.as_str(), "abc123");
        assert_eq!(pair.job_id.as_str(), "train-7");

        assert!("abc123".parse::<ContainerJob>().is_err());
        assert!("=job".parse::<ContainerJob>().is_err());
        assert!("container=".parse::<ContainerJob>().is_err());
    }

    #[test]
    fn watch_command_line() {
        let cli = Cli::try_parse_from([
            "gpu-monitor",
            "watch",
            "-c",
            "c1=j1",
            "--container",
            "c2=j2",
            "--mode",
            "merge",
            "--interval-ms",
            "250",
        ])
        .unwrap();

        let Commands::Watch(args) = cli.command else {
            panic!("expected watch command");
        };
        assert_eq!(args.containers.len(), 2);
        assert_eq!(args.mode, RegistrationMode::Merge);

        let config = MonitorConfig::from(args.as_ref());
        assert_eq!(config.sample_interval, Duration::from_millis(250));
        assert_eq!(config.visible_devices_env, VISIBLE_DEVICES_ENV);
    }

    #[test]
    fn watch_replaces_the_watch_list_by_default() {
        let cli = Cli::try_parse_from(["gpu-monitor", "watch", "-c", "c1=j1"]).unwrap();

        let Commands::Watch(args) = cli.command else {
            panic!("expected watch command");
        };
        assert_eq!(args.mode, RegistrationMode::Replace);
    }

    #[test]
    fn watch_requires_a_container() {
        assert!(Cli::try_parse_from(["gpu-monitor", "watch"]).is_err());
    }
}
