use clap::Parser;
use cli::{Commands, GlobalArgs, LockCommands, LogLevel};
use commands::{
    check_version::check_cluster_version, converge::converge_cluster, lock_release::release_lock,
};
use env_logger::Target;
use log::{warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;

mod cli;
mod commands;
mod config;
mod context;
mod controller;
mod converge;
mod error;
mod hooks;
mod infra;
mod lock;
mod nodeuser;
mod prompt;
mod restart;
mod retry;
mod ssh;
mod state;
mod switcher;
mod version;

#[cfg(test)]
mod testing;

// Confirmation prompts block a worker thread while the lease renewer keeps running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_logging(&cli.global_args);

    let cancellation = CancellationToken::new();
    watch_interrupt(cancellation.clone());

    match &cli.command {
        Commands::Converge(args) => converge_cluster(&cli.global_args, args, cancellation).await?,
        Commands::Lock {
            command: LockCommands::Release(args),
        } => release_lock(&cli.global_args, args, cancellation).await?,
        Commands::CheckVersion(args) => {
            check_cluster_version(&cli.global_args, args, cancellation).await?
        }
    }

    Ok(())
}

fn watch_interrupt(cancellation: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next safe point...");
            cancellation.cancel();
        }
    });
}

fn configure_logging(global_args: &GlobalArgs) {
    let log_level = global_args.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_timestamp(None)
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .format_level(false)
        .target(Target::Stderr);

    if let LogLevel::Normal = log_level {
        logger.filter(Some("dhctl"), LevelFilter::Info);
        logger.filter(Some("dhctl_core"), LevelFilter::Info);
    }

    if let LogLevel::Verbose = log_level {
        logger.filter(Some("dhctl"), LevelFilter::Debug);
        logger.filter(Some("dhctl_core"), LevelFilter::Debug);
    }

    if let LogLevel::Trace = log_level {
        logger.filter(None, LevelFilter::Debug);
    }

    logger.init();
}
