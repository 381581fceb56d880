use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use dhctl_core::{CONVERGE_LOCK_NAME, SYSTEM_NAMESPACE};

pub const DEFAULT_CONFIG_PATH: &str = "converge.yaml";

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// override default kubeconfig
    #[arg(long, global = true)]
    pub kube_config: Option<String>,
    /// override default kubeconfig context
    #[arg(long, global = true)]
    pub kube_context: Option<String>,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace", global = true)]
    pub trace_logging: bool,
}

impl GlobalArgs {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Subcommand)]
#[command(arg_required_else_help = true)]
pub enum Commands {
    /// bring masters and cloud-permanent node groups in line with the configuration
    #[command(alias = "c")]
    Converge(ConvergeArgs),
    /// manage the cluster-wide converge lock
    #[command(alias = "l")]
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// compare this dhctl version with the Deckhouse version running in the cluster
    CheckVersion(CheckVersionArgs),
}

#[derive(Debug, Subcommand)]
pub enum LockCommands {
    /// delete the converge lease regardless of who holds it
    Release(LockReleaseArgs),
}

#[derive(Debug, Args)]
pub struct ConvergeArgs {
    /// path to the converge configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// directory of the local state cache (defaults to ~/.cache/dhctl/<cluster prefix>)
    #[arg(long, env = "DHCTL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
    /// answer yes to every confirmation
    #[arg(short = 'y', long)]
    pub auto_approve: bool,
    /// refuse destructive changes instead of asking about them
    #[arg(long)]
    pub auto_dismiss_destructive: bool,
    /// run embedded in the commander: no prompts, no node user switch, no hosts cache
    #[arg(long)]
    pub commander_mode: bool,
    /// take the converge lock over even if someone else holds it
    #[arg(long)]
    pub force_lock: bool,
    /// continue with a warning when the cluster runs another Deckhouse version
    #[arg(long)]
    pub allow_version_mismatch: bool,
    /// continue when the installed Deckhouse version can't be determined
    #[arg(long)]
    pub allow_missing_version: bool,
}

#[derive(Debug, Args)]
pub struct LockReleaseArgs {
    /// namespace of the converge lease
    #[arg(short = 'n', long, default_value = SYSTEM_NAMESPACE)]
    pub namespace: String,
    /// name of the converge lease
    #[arg(long, default_value = CONVERGE_LOCK_NAME)]
    pub name: String,
}

#[derive(Debug, Args)]
pub struct CheckVersionArgs {
    /// succeed when the installed Deckhouse version can't be determined
    #[arg(long)]
    pub allow_missing_version: bool,
}
