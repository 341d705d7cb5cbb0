//! Closing the loop on an issue once its batch job has run.
//!
//! These helpers are what an automation script calls at the end of its job:
//! they rebuild a tracker client from the job package, then attach results,
//! set the final status, and leave a note.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use coordination::{upload_with_retry, JobPackage, RemoteStore, RetryPolicy, TransferError};
use tracing::{info, warn};

use crate::config::StatusConfig;
use crate::tracker::{IssueTracker, IssueUpdate, TrackerError};

/// Final status a job can leave its issue in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportStatus {
    Resolved,
    Feedback,
    Error,
}

impl ReportStatus {
    pub fn status_id(self, statuses: &StatusConfig) -> u64 {
        match self {
            Self::Resolved => statuses.resolved,
            Self::Feedback => statuses.feedback,
            Self::Error => statuses.error,
        }
    }
}

/// What to post on the issue.
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub status: Option<ReportStatus>,
    pub note: Option<String>,
    pub uploads: Vec<PathBuf>,
    /// Identifiers the requester asked for. Any that no uploaded file name
    /// mentions are listed in a warning note.
    pub expected: Vec<String>,
}

/// Warning listing the requested identifiers that were not found, in request
/// order. `None` when everything was found.
pub fn missing_identifiers_note(requested: &[String], found: &[String]) -> Option<String> {
    let found: BTreeSet<&str> = found.iter().map(String::as_str).collect();
    let mut seen = BTreeSet::new();
    let missing: Vec<&str> = requested
        .iter()
        .map(String::as_str)
        .filter(|id| !found.contains(id) && seen.insert(*id))
        .collect();

    if missing.is_empty() {
        None
    } else {
        Some(format!(
            "WARNING: Could not find the following requested identifiers: {}",
            missing.join(", ")
        ))
    }
}

/// The expected identifiers that appear as a whole token of some file name.
/// Names are split on `_`, `.` and whitespace, so `2014-SEQ-0276_amr.csv`
/// carries `2014-SEQ-0276` but not `2014-SEQ-027`.
pub fn identifiers_in_file_names(expected: &[String], file_names: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|id| {
            file_names.iter().any(|name| {
                name.split(|c: char| c == '_' || c == '.' || c.is_whitespace())
                    .any(|token| token == id.as_str())
            })
        })
        .cloned()
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Upload files, then post status and note in a single update. A missing
/// identifiers warning goes out as its own note first.
pub async fn report(
    tracker: &dyn IssueTracker,
    package: &JobPackage,
    statuses: &StatusConfig,
    request: ReportRequest,
) -> Result<(), TrackerError> {
    let issue_id = package.issue.id;

    let names: Vec<String> = request.uploads.iter().map(|p| file_name(p)).collect();
    let found = identifiers_in_file_names(&request.expected, &names);
    if let Some(warning) = missing_identifiers_note(&request.expected, &found) {
        warn!(issue = issue_id, "{warning}");
        tracker
            .update_issue(issue_id, IssueUpdate::new().notes(warning))
            .await?;
    }

    let mut update = IssueUpdate::new();
    for path in &request.uploads {
        let upload = tracker.upload_file(path).await?;
        info!(issue = issue_id, file = %upload.filename, "Uploaded result file");
        update = update.upload(upload);
    }
    if let Some(status) = request.status {
        update = update.status(status.status_id(statuses));
    }
    if let Some(note) = request.note {
        update = update.notes(note);
    }

    if update == IssueUpdate::new() {
        return Ok(());
    }
    tracker.update_issue(issue_id, update).await
}

/// How an FTP publication ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { url: String, attempts: u32 },
    /// The store kept timing out; the issue was told to try again later.
    GaveUp { attempts: u32 },
    /// A non-timeout failure; the issue got the error message.
    Failed { reason: String },
}

/// Upload `file` to the remote store and tell the issue where it landed.
///
/// The upload is blocking; this is meant for the one-shot CLI path, not the
/// dispatch loop.
pub async fn publish_via_ftp(
    tracker: &dyn IssueTracker,
    package: &JobPackage,
    store: &dyn RemoteStore,
    file: &Path,
    policy: RetryPolicy,
    statuses: &StatusConfig,
) -> Result<PublishOutcome, TrackerError> {
    let issue_id = package.issue.id;
    let remote_name = file_name(file);
    let job = package.job_type.to_uppercase();

    let (outcome, update) = match upload_with_retry(store, file, &remote_name, policy) {
        Ok(report) => {
            let url = store.url(&remote_name);
            info!(issue = issue_id, %url, attempts = report.attempts, "Published result");
            let update = IssueUpdate::new().status(statuses.feedback).notes(format!(
                "{job} process complete!\n\nResults are available at the following FTP address:\n{url}"
            ));
            (
                PublishOutcome::Published {
                    url,
                    attempts: report.attempts,
                },
                update,
            )
        }
        Err(TransferError::Exhausted { attempts, .. }) => {
            warn!(issue = issue_id, attempts, "Giving up on FTP upload");
            let update = IssueUpdate::new().status(statuses.error).notes(format!(
                "There are connection issues with the FTP site. Unable to complete the \
                 {job} process. Please try again later."
            ));
            (PublishOutcome::GaveUp { attempts }, update)
        }
        Err(e) => {
            warn!(issue = issue_id, "FTP upload failed: {e}");
            let reason = e.to_string();
            let update = IssueUpdate::new().status(statuses.error).notes(format!(
                "Something went wrong! Send this error to your friendly neighborhood \
                 bioinformatician: {reason}"
            ));
            (PublishOutcome::Failed { reason }, update)
        }
    };

    tracker.update_issue(issue_id, update).await?;
    Ok(outcome)
}
