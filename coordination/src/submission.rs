//! Scheduler submission with an on-disk idempotency record.
//!
//! Once `sbatch` returns a job id, a `submission.json` record is written into
//! the issue's work directory. A later cycle that finds the issue still "New"
//! (because the status update was lost) sees the record and only retries the
//! status update. If the process died between `sbatch` returning and the
//! record landing on disk, the scheduler is asked for a live job named after
//! the issue and that job is adopted instead of submitting a second one.
//!
//! Once the tracker accepted the claim, the record is marked `claimed`. A
//! claimed record on an issue that is "New" again means the requester
//! reopened it for another run: the record is archived and a fresh job is
//! submitted.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::package::{AutomationCommand, PackageError};
use crate::routing::JobType;
use crate::slurm::{BatchScheduler, BatchScript, JobId, SlurmError, DEFAULT_TIME_LIMIT};
use crate::workdir::WorkDir;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Failed to write batch script {path}: {source}")]
    Script {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] PackageError),

    #[error("Scheduler rejected the job: {0}")]
    Scheduler(#[from] SlurmError),

    #[error("Failed to read submission record {path}: {reason}")]
    RecordRead { path: PathBuf, reason: String },

    #[error("Failed to write submission record {path}: {source}")]
    RecordWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Proof that an issue's job reached the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub issue_id: u64,
    pub job_id: JobId,
    pub scheduler: String,
    /// Package the job was submitted with; unknown for adopted jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    /// The tracker has been told about this job.
    #[serde(default)]
    pub claimed: bool,
}

impl SubmissionRecord {
    pub fn load(work_dir: &WorkDir) -> Result<Option<Self>, SubmissionError> {
        let path = work_dir.submission_record_path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SubmissionError::RecordRead {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SubmissionError::RecordRead {
                path,
                reason: e.to_string(),
            })
    }

    pub fn write(&self, work_dir: &WorkDir) -> Result<(), SubmissionError> {
        let path = work_dir.submission_record_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self).map_err(|e| SubmissionError::RecordWrite {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|source| SubmissionError::RecordWrite { path, source })
    }

    /// Persist that the issue was moved to "In Progress" for this job.
    pub fn mark_claimed(&mut self, work_dir: &WorkDir) -> Result<(), SubmissionError> {
        self.claimed = true;
        self.write(work_dir)
    }

    /// Move the record aside so the next run starts from a clean slate.
    fn archive(&self, work_dir: &WorkDir) -> Result<PathBuf, SubmissionError> {
        let from = work_dir.submission_record_path();
        let to = work_dir.archived_record_path(&self.job_id);
        std::fs::rename(&from, &to)
            .map_err(|source| SubmissionError::RecordWrite { path: to.clone(), source })?;
        Ok(to)
    }
}

/// Where a submission came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Submitted in this call.
    Submitted(SubmissionRecord),
    /// A record from an earlier cycle already existed.
    AlreadySubmitted(SubmissionRecord),
    /// No record, but the scheduler already held a live job for the issue.
    Adopted(SubmissionRecord),
}

impl SubmissionOutcome {
    pub fn record(&self) -> &SubmissionRecord {
        match self {
            Self::Submitted(r) | Self::AlreadySubmitted(r) | Self::Adopted(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }
}

/// Batch script settings shared by every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    pub time_limit: String,
    pub partition: Option<String>,
    /// Environment activation script sourced before the command.
    pub activation: Option<PathBuf>,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            time_limit: DEFAULT_TIME_LIMIT.to_string(),
            partition: None,
            activation: None,
        }
    }
}

/// Renders, writes and submits batch scripts.
#[derive(Clone)]
pub struct Submitter {
    scheduler: Arc<dyn BatchScheduler>,
    settings: ScriptSettings,
}

impl Submitter {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, settings: ScriptSettings) -> Self {
        Self {
            scheduler,
            settings,
        }
    }

    pub fn scheduler_kind(&self) -> &'static str {
        self.scheduler.kind()
    }

    /// Look for evidence that this issue was already submitted: a record on
    /// disk first, then a live job named after the issue. An adopted job gets
    /// a record written for it.
    pub fn prior_submission(
        &self,
        work_dir: &WorkDir,
    ) -> Result<Option<SubmissionOutcome>, SubmissionError> {
        if let Some(record) = SubmissionRecord::load(work_dir)? {
            if record.claimed {
                let archived = record.archive(work_dir)?;
                info!(
                    issue = record.issue_id,
                    previous_job = %record.job_id,
                    archived = %archived.display(),
                    "Issue reopened after a completed run, submitting again"
                );
                // A live job under this name belongs to the earlier run.
                return Ok(None);
            }
            info!(
                issue = record.issue_id,
                job = %record.job_id,
                "Issue already has a submission record, not resubmitting"
            );
            return Ok(Some(SubmissionOutcome::AlreadySubmitted(record)));
        }

        let job_name = work_dir.issue_id().to_string();
        match self.scheduler.find_active(&job_name) {
            Ok(Some(job_id)) => {
                warn!(
                    issue = work_dir.issue_id(),
                    job = %job_id,
                    "Found live job without a submission record, adopting it"
                );
                let record = SubmissionRecord {
                    issue_id: work_dir.issue_id(),
                    job_id,
                    scheduler: self.scheduler.kind().to_string(),
                    package_id: None,
                    submitted_at: Utc::now(),
                    claimed: false,
                };
                record.write(work_dir)?;
                Ok(Some(SubmissionOutcome::Adopted(record)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // An unreachable squeue must not block submission; the record
                // still guards the common case.
                warn!(issue = work_dir.issue_id(), "Could not query scheduler for live jobs: {e}");
                Ok(None)
            }
        }
    }

    /// Render and write the batch script, submit it, and persist the record.
    ///
    /// The caller must have checked [`Submitter::prior_submission`] first.
    pub fn submit(
        &self,
        job_type: &JobType,
        command: &AutomationCommand,
        package_id: Option<Uuid>,
        work_dir: &WorkDir,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let job_name = work_dir.issue_id().to_string();
        let script = BatchScript::render(
            &job_name,
            job_type,
            &self.settings.time_limit,
            self.settings.partition.as_deref(),
            work_dir.path(),
            self.settings.activation.as_deref(),
            &command.to_shell()?,
        );

        let script_path = work_dir.batch_script_path();
        script
            .write(&script_path)
            .map_err(|source| SubmissionError::Script {
                path: script_path.clone(),
                source,
            })?;

        info!(issue = work_dir.issue_id(), scheduler = self.scheduler.kind(), "Submitting job");
        let job_id = self.scheduler.submit(&script_path, &job_name)?;

        let record = SubmissionRecord {
            issue_id: work_dir.issue_id(),
            job_id,
            scheduler: self.scheduler.kind().to_string(),
            package_id,
            submitted_at: Utc::now(),
            claimed: false,
        };
        if let Err(e) = record.write(work_dir) {
            // The job is already queued; losing the record only weakens the
            // duplicate guard to the scheduler lookup.
            warn!(issue = work_dir.issue_id(), "{e}");
        }
        info!(
            issue = work_dir.issue_id(),
            job = %record.job_id,
            output = %work_dir.path().display(),
            "Job submitted"
        );
        Ok(SubmissionOutcome::Submitted(record))
    }
}
