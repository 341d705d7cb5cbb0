//! Polling Dispatch Loop
//!
//! ```text
//!   Idle ──wake──► Scanning ──cycle done──► Idle (sleep poll_interval)
//! ```
//!
//! A cycle lists the project's open issues, keeps those still in the "New"
//! status, routes them by subject, and runs each routed issue through
//!
//! ```text
//! ensure_work_dir → prior submission? ──yes──► claim
//!                          │no
//!                          ▼
//!                 package → command → submit → claim
//! ```
//!
//! Every issue has its own error boundary: a failure is turned into a note on
//! that issue and the cycle moves on.
//!
//! Work directory, package and scheduler calls block, so that half of the
//! pipeline runs on tokio's blocking pool. Up to `max_concurrent` issues are
//! staged at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use coordination::{
    parse_description, AutomationCommand, JobPackage, JobType, Launcher, PackageError,
    RoutingTable, SubmissionError, SubmissionOutcome, Submitter, TrackerHandle, WorkDir,
    WorkDirError, WorkDirManager,
};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StatusConfig;
use crate::tracker::{Issue, IssueTracker, IssueUpdate, TrackerError};

/// Which pipeline stage an issue failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WorkDir,
    Package,
    Submit,
    Tracker,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkDir => write!(f, "workdir"),
            Self::Package => write!(f, "package"),
            Self::Submit => write!(f, "submit"),
            Self::Tracker => write!(f, "tracker"),
        }
    }
}

/// Per-issue pipeline failure.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Work directory: {0}")]
    WorkDir(#[from] WorkDirError),

    #[error("Job package: {0}")]
    Package(#[from] PackageError),

    #[error("Submission: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Tracker: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Staging task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DispatchError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::WorkDir(_) => Stage::WorkDir,
            Self::Package(_) => Stage::Package,
            // A record that cannot be read needs a human, like a bad package.
            Self::Submission(SubmissionError::Command(_) | SubmissionError::RecordRead { .. }) => {
                Stage::Package
            }
            Self::Submission(_) | Self::Join(_) => Stage::Submit,
            Self::Tracker(_) => Stage::Tracker,
        }
    }

    /// Work directory and packaging failures will not fix themselves on the
    /// next poll, so the issue is moved out of "New".
    pub fn sets_error_status(&self) -> bool {
        matches!(self.stage(), Stage::WorkDir | Stage::Package)
    }

    /// Whether a note should be posted at all. A failed tracker call would
    /// most likely fail again for the note.
    pub fn notifies_issue(&self) -> bool {
        self.stage() != Stage::Tracker
    }

    /// Human readable note for the issue.
    pub fn user_note(&self, job_type: &JobType) -> String {
        let job = job_type.keyword.to_uppercase();
        match self.stage() {
            Stage::WorkDir | Stage::Package => format!(
                "Your {job} job could not be prepared and was not submitted. \
                 Please contact your friendly neighborhood bioinformatician.\n\nError: {self}"
            ),
            Stage::Submit => format!(
                "Your {job} job could not be submitted to the cluster. \
                 It will be retried automatically.\n\nError: {self}"
            ),
            Stage::Tracker => format!("Something went wrong updating this issue: {self}"),
        }
    }
}

/// Result of handling one routed issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    /// A new batch job was submitted and the issue claimed.
    Submitted { job_id: String },
    /// An earlier submission was found and the issue claimed.
    Resumed { job_id: String },
    Failed { stage: Stage },
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Open issues returned by the tracker.
    pub seen: usize,
    /// Issues still in the "New" status.
    pub new: usize,
    /// New issues whose subject matched a job type.
    pub routed: usize,
    pub submitted: usize,
    pub resumed: usize,
    pub failed: usize,
    /// Issue ids listed more than once in the same cycle.
    pub duplicates: usize,
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seen={} new={} routed={} submitted={} resumed={} failed={} duplicates={}",
            self.seen,
            self.new,
            self.routed,
            self.submitted,
            self.resumed,
            self.failed,
            self.duplicates
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Scanning,
}

/// The blocking half of the per-issue pipeline.
struct Stager {
    workdirs: WorkDirManager,
    submitter: Submitter,
    launcher: Launcher,
    tracker_handle: TrackerHandle,
}

impl Stager {
    /// Work directory, then either an earlier submission or
    /// package → command → submit.
    fn stage(
        &self,
        issue: &Issue,
        job_type: &JobType,
    ) -> Result<(WorkDir, SubmissionOutcome), DispatchError> {
        let work_dir = self.workdirs.ensure_work_dir(issue.id)?;
        if let Err(e) = work_dir.write_issue_details(&issue.details_text()) {
            warn!(issue = issue.id, "Could not write issue details: {e}");
        }

        if let Some(prior) = self.submitter.prior_submission(&work_dir)? {
            return Ok((work_dir, prior));
        }

        let package = JobPackage::new(
            &job_type.keyword,
            self.tracker_handle.clone(),
            issue.handle(),
            parse_description(issue.description()),
            &work_dir,
        );
        let package_path = package.write(&work_dir)?;
        let command =
            AutomationCommand::build(&self.launcher, &job_type.script, &package_path, &work_dir)?;

        let outcome =
            self.submitter
                .submit(job_type, &command, Some(package.package_id), &work_dir)?;
        Ok((work_dir, outcome))
    }
}

/// Everything the dispatcher needs, injected explicitly.
pub struct Dispatcher {
    tracker: Arc<dyn IssueTracker>,
    routes: RoutingTable,
    stager: Arc<Stager>,
    project: String,
    statuses: StatusConfig,
    poll_interval: Duration,
    max_concurrent: usize,
}

pub struct DispatcherParts {
    pub tracker: Arc<dyn IssueTracker>,
    pub routes: RoutingTable,
    pub workdirs: WorkDirManager,
    pub submitter: Submitter,
    pub launcher: Launcher,
    pub tracker_handle: TrackerHandle,
    pub statuses: StatusConfig,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            tracker: parts.tracker,
            routes: parts.routes,
            project: parts.tracker_handle.project.clone(),
            stager: Arc::new(Stager {
                workdirs: parts.workdirs,
                submitter: parts.submitter,
                launcher: parts.launcher,
                tracker_handle: parts.tracker_handle,
            }),
            statuses: parts.statuses,
            poll_interval: parts.poll_interval,
            max_concurrent: parts.max_concurrent.max(1),
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    fn is_new(&self, issue: &Issue) -> bool {
        issue.status.name.eq_ignore_ascii_case(&self.statuses.new_name)
    }

    /// Run poll cycles until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            project = %self.project,
            interval_secs = self.poll_interval.as_secs(),
            job_types = self.routes.len(),
            scheduler = self.stager.submitter.scheduler_kind(),
            "Automator operational"
        );

        while !cancel.is_cancelled() {
            let mut state = LoopState::Scanning;
            debug!(?state, "Polling tracker");

            match self.run_cycle().await {
                Ok(report) if report.routed > 0 => info!(%report, "Cycle complete"),
                Ok(report) => debug!(%report, "Cycle complete"),
                Err(e) => warn!(transient = e.is_transient(), "Failed to list issues: {e}"),
            }

            state = LoopState::Idle;
            debug!(?state, "Sleeping");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Dispatch loop stopped");
    }

    /// One Scanning pass: list, filter, route, and process every new issue.
    pub async fn run_cycle(&self) -> Result<CycleReport, TrackerError> {
        let issues = self.tracker.list_issues(&self.project).await?;

        let mut report = CycleReport {
            seen: issues.len(),
            ..Default::default()
        };

        let mut claimed = HashSet::new();
        let mut routed: Vec<(Issue, JobType)> = Vec::new();
        for issue in issues {
            // Anything past "New" was claimed in an earlier cycle.
            if !self.is_new(&issue) {
                continue;
            }
            report.new += 1;

            let Some(job_type) = self.routes.route(&issue.subject) else {
                debug!(issue = issue.id, subject = %issue.subject, "No job type for subject");
                continue;
            };
            if !claimed.insert(issue.id) {
                warn!(issue = issue.id, "Issue listed twice in one cycle, skipping duplicate");
                report.duplicates += 1;
                continue;
            }
            info!(issue = issue.id, job_type = %job_type.keyword, "Detected job");
            routed.push((issue, job_type.clone()));
        }
        report.routed = routed.len();

        let outcomes: Vec<IssueOutcome> = stream::iter(routed)
            .map(|(issue, job_type)| async move { self.handle_issue(&issue, &job_type).await })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                IssueOutcome::Submitted { .. } => report.submitted += 1,
                IssueOutcome::Resumed { .. } => report.resumed += 1,
                IssueOutcome::Failed { .. } => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Error boundary around [`Dispatcher::process_issue`].
    pub async fn handle_issue(&self, issue: &Issue, job_type: &JobType) -> IssueOutcome {
        match self.process_issue(issue, job_type).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let stage = e.stage();
                error!(issue = issue.id, %stage, "Failed to dispatch issue: {e}");
                if e.notifies_issue() {
                    self.notify_failure(issue, job_type, &e).await;
                }
                IssueOutcome::Failed { stage }
            }
        }
    }

    /// Post the failure note. A submission that keeps failing is reported
    /// once; a marker in the work directory remembers that the requester
    /// already knows.
    async fn notify_failure(&self, issue: &Issue, job_type: &JobType, e: &DispatchError) {
        let marker = self
            .stager
            .workdirs
            .work_dir(issue.id)
            .submit_failure_marker_path();
        let submit_stage = e.stage() == Stage::Submit;
        if submit_stage && tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            debug!(issue = issue.id, "Submission still failing, requester already notified");
            return;
        }

        let mut update = IssueUpdate::new().notes(e.user_note(job_type));
        if e.sets_error_status() {
            update = update.status(self.statuses.error);
        }
        if let Err(note_err) = self.tracker.update_issue(issue.id, update).await {
            warn!(issue = issue.id, "Could not post failure note: {note_err}");
            return;
        }
        if submit_stage {
            if let Err(io) = tokio::fs::write(&marker, chrono::Utc::now().to_rfc3339()).await {
                warn!(issue = issue.id, "Could not write {}: {io}", marker.display());
            }
        }
    }

    /// Stage on the blocking pool, then claim the issue.
    pub async fn process_issue(
        &self,
        issue: &Issue,
        job_type: &JobType,
    ) -> Result<IssueOutcome, DispatchError> {
        let stager = Arc::clone(&self.stager);
        let (owned_issue, owned_job) = (issue.clone(), job_type.clone());
        let (work_dir, outcome) =
            tokio::task::spawn_blocking(move || stager.stage(&owned_issue, &owned_job)).await??;

        match tokio::fs::remove_file(work_dir.submit_failure_marker_path()).await {
            Ok(()) => debug!(issue = issue.id, "Cleared earlier submission failure"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(issue = issue.id, "Could not clear failure marker: {e}"),
        }

        self.claim(issue, job_type, &outcome).await?;

        let mut record = outcome.record().clone();
        let job_id = record.job_id.clone();
        match tokio::task::spawn_blocking(move || record.mark_claimed(&work_dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(issue = issue.id, "Could not mark submission as claimed: {e}"),
            Err(e) => warn!(issue = issue.id, "Could not mark submission as claimed: {e}"),
        }

        Ok(if outcome.is_new() {
            IssueOutcome::Submitted { job_id }
        } else {
            IssueOutcome::Resumed { job_id }
        })
    }

    /// Move the issue to "In Progress". Only called once a job id exists.
    async fn claim(
        &self,
        issue: &Issue,
        job_type: &JobType,
        outcome: &SubmissionOutcome,
    ) -> Result<(), TrackerError> {
        let record = outcome.record();
        let notes = format!(
            "Your {} job has been submitted to the {} cluster (job {}).",
            job_type.keyword.to_uppercase(),
            record.scheduler,
            record.job_id
        );
        self.tracker
            .update_issue(
                issue.id,
                IssueUpdate::new()
                    .status(self.statuses.in_progress)
                    .notes(notes),
            )
            .await?;
        info!(issue = issue.id, job = %record.job_id, "Updated issue to In Progress");
        Ok(())
    }
}
