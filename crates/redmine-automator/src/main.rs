//! Redmine automator
//!
//! # Usage
//!
//! ```bash
//! # Poll forever
//! REDMINE_API_KEY=... redmine-automator --config automator.toml run
//!
//! # One cycle, then print what happened
//! redmine-automator once
//!
//! # From inside a batch job, when it is done
//! redmine-automator report --package job_package.json --status resolved \
//!     --note "Results attached" --upload summary.csv
//! redmine-automator ftp-upload --package job_package.json --file results.zip
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::{
    BatchScheduler, CurlFtp, JobPackage, LocalShellScheduler, SlurmConfig, SlurmScheduler,
    Submitter, WorkDirManager,
};
use redmine_automator::config::{AutomatorConfig, SchedulerKind};
use redmine_automator::dispatch::{Dispatcher, DispatcherParts};
use redmine_automator::report::{self, ReportRequest, ReportStatus};
use redmine_automator::tracker::{IssueTracker, RedmineClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "automator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the tracker until interrupted
    Run,
    /// Run a single poll cycle and print its report
    Once,
    /// Print the subject routing table
    Routes,
    /// Post final status, notes and result files for a packaged job
    Report {
        #[arg(long)]
        package: PathBuf,
        #[arg(long, value_enum)]
        status: Option<ReportStatus>,
        #[arg(long)]
        note: Option<String>,
        /// File to attach (repeatable)
        #[arg(long = "upload")]
        uploads: Vec<PathBuf>,
        /// Identifier the requester asked for (repeatable)
        #[arg(long = "expect")]
        expected: Vec<String>,
    },
    /// Upload a result archive over FTP and post its location
    FtpUpload {
        #[arg(long)]
        package: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AutomatorConfig::load(&cli.config)?;

    match cli.command {
        Command::Run => {
            let dispatcher = build_dispatcher(&config)?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {e}");
                    return;
                }
                info!("Shutdown requested");
                on_signal.cancel();
            });
            dispatcher.run(cancel).await;
        }
        Command::Once => {
            let dispatcher = build_dispatcher(&config)?;
            let report = dispatcher
                .run_cycle()
                .await
                .context("Poll cycle failed")?;
            println!("{report}");
        }
        Command::Routes => {
            let routes = config.routing_table()?;
            for job in routes.job_types() {
                println!(
                    "{:<24} {:<32} cpus={:<3} mem={}MB",
                    job.keyword, job.script, job.cpus, job.memory_mb
                );
            }
        }
        Command::Report {
            package,
            status,
            note,
            uploads,
            expected,
        } => {
            let package = JobPackage::load(&package)?;
            let tracker = RedmineClient::from_handle(&package.tracker, config.tracker_timeout())?;
            let request = ReportRequest {
                status,
                note,
                uploads,
                expected,
            };
            report::report(&tracker, &package, &config.statuses, request)
                .await
                .with_context(|| format!("Failed to report on issue {}", package.issue.id))?;
        }
        Command::FtpUpload { package, file } => {
            let ftp = config
                .ftp
                .as_ref()
                .context("No [ftp] section in the configuration")?;
            let package = JobPackage::load(&package)?;
            let tracker = RedmineClient::from_handle(&package.tracker, config.tracker_timeout())?;
            let store = CurlFtp::new(ftp.target()?);
            let outcome = report::publish_via_ftp(
                &tracker,
                &package,
                &store,
                &file,
                ftp.retry_policy(),
                &config.statuses,
            )
            .await
            .with_context(|| format!("Failed to update issue {}", package.issue.id))?;
            info!(?outcome, "FTP upload finished");
        }
    }

    Ok(())
}

fn build_dispatcher(config: &AutomatorConfig) -> Result<Dispatcher> {
    let api_key = std::env::var(&config.tracker.api_key_env)
        .with_context(|| format!("{} is not set", config.tracker.api_key_env))?;
    let client = RedmineClient::new(
        &config.tracker.url,
        api_key,
        config.tracker_timeout(),
        config.tracker.verify_tls,
    )?;
    let tracker: Arc<dyn IssueTracker> = Arc::new(client);

    let scheduler: Arc<dyn BatchScheduler> = match config.scheduler.kind {
        SchedulerKind::Slurm => Arc::new(SlurmScheduler::new(SlurmConfig {
            slurm_host: config.scheduler.slurm_host.clone(),
        })),
        SchedulerKind::Local => Arc::new(LocalShellScheduler::new()),
    };

    Ok(Dispatcher::new(DispatcherParts {
        tracker,
        routes: config.routing_table()?,
        workdirs: WorkDirManager::new(&config.dispatch.work_root),
        submitter: Submitter::new(scheduler, config.script_settings()),
        launcher: config.launcher.clone(),
        tracker_handle: config.tracker_handle(),
        statuses: config.statuses.clone(),
        poll_interval: config.poll_interval(),
        max_concurrent: config.dispatch.max_concurrent_issues,
    }))
}
