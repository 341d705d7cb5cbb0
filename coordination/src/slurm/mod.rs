//! Batch job submission for dispatched automation jobs.
//!
//! Renders the per-issue batch script, submits it to Slurm with `sbatch`
//! (directly or over SSH to the controller) or runs it on the local shell,
//! and can look up live jobs by name so a job is never submitted twice.
//!
//! Completion is not tracked here: the automation script reports back to
//! the issue tracker itself.

mod script;

pub use script::{make_executable, BatchScript, DEFAULT_TIME_LIMIT};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error types for scheduler operations
#[derive(Debug, Error)]
pub enum SlurmError {
    #[error("SLURM command failed: {0}")]
    CommandFailed(String),

    #[error("Job submission failed: {0}")]
    SubmitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// SLURM job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Preempted,
    Suspended,
    Unknown,
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "PREEMPTED" | "PR" => Self::Preempted,
            "SUSPENDED" | "S" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

impl JobState {
    /// Queued, running, or finishing. A job in one of these states must not
    /// be submitted again.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Pending | Self::Completing)
    }
}

/// One line of `squeue` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
}

/// Scheduler-assigned job identifier (Slurm job id, or pid for local runs).
pub type JobId = String;

/// Submission seam between the dispatcher and whatever runs the job.
#[cfg_attr(test, mockall::automock)]
pub trait BatchScheduler: Send + Sync {
    /// Submit an already written, executable batch script.
    fn submit(&self, script: &Path, job_name: &str) -> Result<JobId, SlurmError>;

    /// Return the id of a live job with this name, if any.
    fn find_active(&self, job_name: &str) -> Result<Option<JobId>, SlurmError>;

    /// Short name for logs and notes.
    fn kind(&self) -> &'static str;
}

/// Configuration for the Slurm scheduler
#[derive(Debug, Clone, Default)]
pub struct SlurmConfig {
    /// SSH host for SLURM controller (if remote)
    pub slurm_host: Option<String>,
}

/// Submits batch scripts with `sbatch`.
pub struct SlurmScheduler {
    config: SlurmConfig,
}

impl SlurmScheduler {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    /// Run a SLURM command, optionally via SSH to the controller
    fn run_slurm_cmd(&self, cmd: &str, args: &[&str]) -> Result<String, SlurmError> {
        let output = if let Some(ref host) = self.config.slurm_host {
            let quoted: Vec<String> = args
                .iter()
                .map(|a| shlex::try_quote(a).map(|q| q.into_owned()))
                .collect::<Result<_, _>>()
                .map_err(|e| SlurmError::CommandFailed(format!("cannot quote argument: {e}")))?;
            let full_cmd = format!("{} {}", cmd, quoted.join(" "));
            Command::new("ssh")
                .args([host.as_str(), &full_cmd])
                .output()?
        } else {
            Command::new(cmd).args(args).output()?
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(SlurmError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ))
        }
    }

    /// List queued jobs carrying the given name.
    pub fn list_jobs_named(&self, job_name: &str) -> Result<Vec<JobInfo>, SlurmError> {
        let output = self.run_slurm_cmd(
            "squeue",
            &["-n", job_name, "-o", "%i|%j|%T", "--noheader"],
        )?;
        Ok(parse_squeue(&output))
    }
}

impl BatchScheduler for SlurmScheduler {
    fn submit(&self, script: &Path, job_name: &str) -> Result<JobId, SlurmError> {
        let script = script
            .to_str()
            .ok_or_else(|| SlurmError::SubmitFailed(format!("non UTF-8 path {script:?}")))?;

        let output = self
            .run_slurm_cmd("sbatch", &["--parsable", script])
            .map_err(|e| SlurmError::SubmitFailed(e.to_string()))?;

        let job_id = parse_sbatch_output(&output)?;
        tracing::info!(job = job_name, slurm_job = %job_id, "Submitted batch job");
        Ok(job_id)
    }

    fn find_active(&self, job_name: &str) -> Result<Option<JobId>, SlurmError> {
        Ok(self
            .list_jobs_named(job_name)?
            .into_iter()
            .find(|job| job.name == job_name && job.state.is_active())
            .map(|job| job.job_id))
    }

    fn kind(&self) -> &'static str {
        "slurm"
    }
}

/// Runs batch scripts with `bash` on this machine, detached.
///
/// `#SBATCH` lines are plain comments to bash, so the same script works for
/// both schedulers. Output goes to `local.out` / `local.err` beside the
/// script. A watcher thread per job reaps the child when it exits.
pub struct LocalShellScheduler {
    shell: PathBuf,
}

impl LocalShellScheduler {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("bash"),
        }
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalShellScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchScheduler for LocalShellScheduler {
    fn submit(&self, script: &Path, job_name: &str) -> Result<JobId, SlurmError> {
        let dir = script
            .parent()
            .ok_or_else(|| SlurmError::SubmitFailed(format!("script {script:?} has no parent")))?;
        let stdout = std::fs::File::create(dir.join("local.out"))?;
        let stderr = std::fs::File::create(dir.join("local.err"))?;

        let mut child = Command::new(&self.shell)
            .arg(script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| SlurmError::SubmitFailed(format!("failed to spawn {:?}: {e}", self.shell)))?;

        let pid = child.id().to_string();
        tracing::info!(job = job_name, pid = %pid, "Started local job");

        let name = job_name.to_string();
        std::thread::Builder::new()
            .name(format!("local-job-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => tracing::info!(job = %name, %status, "Local job finished"),
                Err(e) => tracing::warn!(job = %name, "Failed to wait for local job: {e}"),
            })?;
        Ok(pid)
    }

    fn find_active(&self, _job_name: &str) -> Result<Option<JobId>, SlurmError> {
        // Local jobs are not tracked across restarts; the submission record is
        // the only guard.
        Ok(None)
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

/// `sbatch --parsable` prints `<job id>` or `<job id>;<cluster>`.
pub fn parse_sbatch_output(output: &str) -> Result<JobId, SlurmError> {
    output
        .trim()
        .split(';')
        .next()
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '_'))
        .map(str::to_string)
        .ok_or_else(|| SlurmError::Parse(format!("Failed to parse job ID from: {}", output)))
}

/// Parse `squeue -o "%i|%j|%T" --noheader` output, skipping malformed lines.
pub fn parse_squeue(output: &str) -> Vec<JobInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return None;
            }
            Some(JobInfo {
                job_id: parts[0].to_string(),
                name: parts[1].to_string(),
                state: JobState::from(parts[2]),
            })
        })
        .collect()
}
