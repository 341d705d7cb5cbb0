//! Job Packager: the context bundle handed to a separately launched
//! automation script.
//!
//! The package is a small versioned JSON document. It carries enough to let
//! the worker rebuild its own tracker client (base URL plus the *name* of the
//! environment variable holding the API key) and act on the issue, never a
//! live client or a secret.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::workdir::WorkDir;

pub const PACKAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Failed to serialize job package: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write job package {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read job package {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unsupported job package format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("Cannot quote command for the shell: {0}")]
    Quote(String),
}

/// How a worker reconnects to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerHandle {
    pub base_url: String,
    pub project: String,
    /// Environment variable the worker reads the API key from.
    pub api_key_env: String,
    /// Off for trackers behind a self-signed certificate.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_verify_tls() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: u64,
    pub filename: String,
}

/// The subset of an issue the worker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueHandle {
    pub id: u64,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPackage {
    pub format_version: u32,
    pub package_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Normalized keyword of the job type this issue was routed to.
    pub job_type: String,
    pub tracker: TrackerHandle,
    pub issue: IssueHandle,
    pub work_dir: PathBuf,
    /// Description lines, in order, trailing whitespace stripped.
    pub description: Vec<String>,
}

/// Split a raw issue description into lines.
///
/// Handles `\r\n` line endings and strips trailing whitespace from every
/// line. Blank lines are kept; interpreting them is the automation script's
/// business.
pub fn parse_description(raw: &str) -> Vec<String> {
    raw.split('\n')
        .map(|line| line.trim_end().to_string())
        .collect()
}

impl JobPackage {
    pub fn new(
        job_type: &str,
        tracker: TrackerHandle,
        issue: IssueHandle,
        description: Vec<String>,
        work_dir: &WorkDir,
    ) -> Self {
        Self {
            format_version: PACKAGE_FORMAT_VERSION,
            package_id: Uuid::new_v4(),
            created_at: Utc::now(),
            job_type: job_type.to_string(),
            tracker,
            issue,
            work_dir: work_dir.path().to_path_buf(),
            description,
        }
    }

    /// Persist into the work directory. The file is written next to its final
    /// name and renamed, so a reader never sees a half-written package.
    pub fn write(&self, work_dir: &WorkDir) -> Result<PathBuf, PackageError> {
        let path = work_dir.package_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;

        std::fs::write(&tmp, json).map_err(|source| PackageError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| PackageError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(
            issue = self.issue.id,
            package = %self.package_id,
            path = %path.display(),
            "Wrote job package"
        );
        Ok(path)
    }

    /// Read a package back, rejecting format versions this build does not
    /// understand.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| PackageError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        #[derive(Deserialize)]
        struct VersionHeader {
            format_version: u32,
        }
        let header: VersionHeader = serde_json::from_slice(&bytes)?;
        if header.format_version != PACKAGE_FORMAT_VERSION {
            return Err(PackageError::UnsupportedVersion {
                found: header.format_version,
                expected: PACKAGE_FORMAT_VERSION,
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// How automation scripts are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launcher {
    /// Interpreter, e.g. `python`.
    pub interpreter: String,
    /// Directory that holds the automation scripts.
    pub automators_dir: PathBuf,
}

/// The exact argument list the batch job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationCommand {
    argv: Vec<String>,
}

impl AutomationCommand {
    /// `<interpreter> <automators_dir>/<script> --package <p> --work_dir <wd>`
    pub fn build(
        launcher: &Launcher,
        script: &str,
        package_path: &Path,
        work_dir: &WorkDir,
    ) -> Result<Self, PackageError> {
        let script_path = launcher.automators_dir.join(script);
        Ok(Self {
            argv: vec![
                launcher.interpreter.clone(),
                utf8(&script_path)?.to_string(),
                "--package".to_string(),
                utf8(package_path)?.to_string(),
                "--work_dir".to_string(),
                utf8(work_dir.path())?.to_string(),
            ],
        })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Render as one shell-quoted line for the batch script.
    pub fn to_shell(&self) -> Result<String, PackageError> {
        shlex::try_join(self.argv.iter().map(String::as_str))
            .map_err(|e| PackageError::Quote(e.to_string()))
    }
}

fn utf8(path: &Path) -> Result<&str, PackageError> {
    path.to_str()
        .ok_or_else(|| PackageError::NonUtf8Path(path.to_path_buf()))
}
