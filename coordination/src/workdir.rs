//! Work Directory Manager: one isolated directory per issue.
//!
//! Layout:
//!
//! ```text
//! <root>/<issue_id>/
//!   job_package.json          serialized context for the automation script
//!   <issue_id>_slurm.sh       generated batch script
//!   submission.json           idempotency record written after sbatch
//!   submission.<job>.json     record of an earlier run, kept when reopened
//!   .submit_failure_noted     the requester was told submission is failing
//!   <issue_id>_issue_details.txt
//!   job_<slurm id>.out / .err
//! ```
//!
//! Creation is idempotent: a directory left behind by an earlier, partially
//! failed cycle is reused.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub const PACKAGE_FILE: &str = "job_package.json";
pub const SUBMISSION_FILE: &str = "submission.json";
pub const SUBMIT_FAILURE_MARKER: &str = ".submit_failure_noted";

#[derive(Debug, Error)]
pub enum WorkDirError {
    #[error("Cannot create work root {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot create work directory {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Work directory path {0} exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A per-issue work directory and the well-known paths inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    issue_id: u64,
    path: PathBuf,
}

impl WorkDir {
    pub fn issue_id(&self) -> u64 {
        self.issue_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_path(&self) -> PathBuf {
        self.path.join(PACKAGE_FILE)
    }

    pub fn batch_script_path(&self) -> PathBuf {
        self.path.join(format!("{}_slurm.sh", self.issue_id))
    }

    pub fn submission_record_path(&self) -> PathBuf {
        self.path.join(SUBMISSION_FILE)
    }

    /// Where a finished run's record is moved when the issue is reopened.
    pub fn archived_record_path(&self, job_id: &str) -> PathBuf {
        self.path.join(format!("submission.{job_id}.json"))
    }

    pub fn submit_failure_marker_path(&self) -> PathBuf {
        self.path.join(SUBMIT_FAILURE_MARKER)
    }

    pub fn details_path(&self) -> PathBuf {
        self.path.join(format!("{}_issue_details.txt", self.issue_id))
    }

    /// Dump a human readable description of the issue next to the job files.
    pub fn write_issue_details(&self, body: &str) -> Result<PathBuf, WorkDirError> {
        let path = self.details_path();
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

/// Owns the `<root>/<issue_id>/` namespace.
#[derive(Debug, Clone)]
pub struct WorkDirManager {
    root: PathBuf,
}

impl WorkDirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the work directory for an issue without touching the disk.
    pub fn work_dir(&self, issue_id: u64) -> WorkDir {
        WorkDir {
            issue_id,
            path: self.root.join(issue_id.to_string()),
        }
    }

    /// Create `<root>/<issue_id>/` if absent; reuse it if present.
    pub fn ensure_work_dir(&self, issue_id: u64) -> Result<WorkDir, WorkDirError> {
        std::fs::create_dir_all(&self.root).map_err(|source| WorkDirError::Root {
            path: self.root.clone(),
            source,
        })?;

        let dir = self.work_dir(issue_id);
        match std::fs::create_dir(dir.path()) {
            Ok(()) => {
                info!(issue = issue_id, path = %dir.path().display(), "Created work directory");
                Ok(dir)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !dir.path().is_dir() {
                    return Err(WorkDirError::NotADirectory(dir.path().to_path_buf()));
                }
                debug!(
                    issue = issue_id,
                    path = %dir.path().display(),
                    "Work directory already exists, reusing"
                );
                Ok(dir)
            }
            Err(source) => Err(WorkDirError::Create {
                path: dir.path().to_path_buf(),
                source,
            }),
        }
    }
}
