use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::watch::WatchArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the GPUs of containers and print their statistics
    Watch(Box<WatchArgs>),
    /// Show driver versions and the GPU devices of this host
    Devices,
}
