//! FTP upload of result archives with bounded retry.
//!
//! The FTP endpoint is unreliable: transfers regularly time out, sometimes
//! after every byte has already arrived. A timed-out attempt is therefore
//! followed by a size check. If the remote file is exactly as large as the
//! local one, the upload counts as done; otherwise the attempt is spent and
//! the upload starts over, up to `max_attempts` times. Errors other than
//! timeouts are not retried.

use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

/// curl exit code for "operation timed out".
const CURL_TIMEOUT: i32 = 28;
/// curl exit code for "FTP couldn't retrieve file" (no such remote file).
const CURL_FTP_NOT_FOUND: i32 = 19;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transfer timed out: {0}")]
    Timeout(String),

    #[error("Transfer failed: {0}")]
    Failed(String),

    #[error("Upload of {file} did not complete after {attempts} attempts")]
    Exhausted { file: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A remote directory files can be uploaded to.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteStore: Send + Sync {
    /// Upload `local` as `remote_name`, replacing any existing file.
    fn upload(&self, local: &Path, remote_name: &str) -> Result<(), TransferError>;

    /// Size of `remote_name` in bytes, `None` if it does not exist.
    fn remote_size(&self, remote_name: &str) -> Result<Option<u64>, TransferError>;

    /// Public URL of `remote_name`, for the note posted to the issue.
    fn url(&self, remote_name: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Upload attempts made, including the successful one.
    pub attempts: u32,
    /// The last attempt timed out but the remote size matched.
    pub verified_by_size: bool,
}

/// Upload with the stall-tolerant retry policy described in the module docs.
pub fn upload_with_retry(
    store: &dyn RemoteStore,
    local: &Path,
    remote_name: &str,
    policy: RetryPolicy,
) -> Result<UploadReport, TransferError> {
    let local_size = std::fs::metadata(local)?.len();
    let mut failed_attempts = 0;

    while failed_attempts < policy.max_attempts {
        let attempt = failed_attempts + 1;
        match store.upload(local, remote_name) {
            Ok(()) => {
                info!(file = remote_name, attempt, "Upload complete");
                return Ok(UploadReport {
                    attempts: attempt,
                    verified_by_size: false,
                });
            }
            Err(e) if e.is_timeout() => match store.remote_size(remote_name) {
                Ok(Some(size)) if size == local_size => {
                    info!(
                        file = remote_name,
                        attempt,
                        size,
                        "Upload timed out but remote size matches, treating as complete"
                    );
                    return Ok(UploadReport {
                        attempts: attempt,
                        verified_by_size: true,
                    });
                }
                Ok(size) => {
                    warn!(
                        file = remote_name,
                        attempt,
                        remote = ?size,
                        local = local_size,
                        "Upload timed out, retrying"
                    );
                }
                Err(size_err) => {
                    warn!(file = remote_name, attempt, "Upload timed out and size check failed: {size_err}");
                }
            },
            Err(e) => return Err(e),
        }
        failed_attempts += 1;
    }

    Err(TransferError::Exhausted {
        file: remote_name.to_string(),
        attempts: failed_attempts,
    })
}

/// FTP endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpTarget {
    pub host: String,
    /// Directory on the server, e.g. `outgoing/cfia-ak`.
    pub directory: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl FtpTarget {
    pub fn url(&self, remote_name: &str) -> String {
        let dir = self.directory.trim_matches('/');
        if dir.is_empty() {
            format!("ftp://{}/{}", self.host, remote_name)
        } else {
            format!("ftp://{}/{}/{}", self.host, dir, remote_name)
        }
    }
}

/// [`RemoteStore`] backed by the `curl` binary.
///
/// Credentials are fed to curl as a config file on stdin, so they never show
/// up in the process list.
pub struct CurlFtp {
    target: FtpTarget,
    bin: String,
}

impl CurlFtp {
    pub fn new(target: FtpTarget) -> Self {
        Self {
            target,
            bin: "curl".to_string(),
        }
    }

    /// Use another curl binary.
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--silent".into(),
            "--show-error".into(),
            "--max-time".into(),
            self.target.timeout.as_secs().max(1).to_string(),
            "--config".into(),
            "-".into(),
        ]
    }

    fn credentials(&self) -> String {
        curl_config_line(
            "user",
            &format!("{}:{}", self.target.user, self.target.password),
        )
    }

    fn run(&self, args: &[String]) -> Result<String, (Option<i32>, String)> {
        let failed = |e: std::io::Error| (None, format!("failed to run {}: {e}", self.bin));
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failed)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.credentials().as_bytes())
                .map_err(failed)?;
        }
        let output = child.wait_with_output().map_err(failed)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err((
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl RemoteStore for CurlFtp {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<(), TransferError> {
        let mut args = self.base_args();
        args.push("--upload-file".into());
        args.push(local.display().to_string());
        args.push(self.target.url(remote_name));

        self.run(&args).map(|_| ()).map_err(|(code, stderr)| match code {
            Some(CURL_TIMEOUT) => TransferError::Timeout(stderr),
            _ => TransferError::Failed(stderr),
        })
    }

    fn remote_size(&self, remote_name: &str) -> Result<Option<u64>, TransferError> {
        let mut args = self.base_args();
        args.push("--head".into());
        args.push(self.target.url(remote_name));

        match self.run(&args) {
            Ok(headers) => Ok(parse_content_length(&headers)),
            Err((Some(CURL_FTP_NOT_FOUND), _)) => Ok(None),
            Err((Some(CURL_TIMEOUT), stderr)) => Err(TransferError::Timeout(stderr)),
            Err((_, stderr)) => Err(TransferError::Failed(stderr)),
        }
    }

    fn url(&self, remote_name: &str) -> String {
        self.target.url(remote_name)
    }
}

/// One `key = "value"` line of a curl config file, quoted so any character
/// in the value survives.
pub fn curl_config_line(key: &str, value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    format!("{key} = \"{quoted}\"\n")
}

/// Pull `Content-Length` out of curl's `--head` output for an FTP URL.
pub fn parse_content_length(headers: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?im)^content-length:\s*(\d+)\s*$").expect("valid content-length regex")
    });
    re.captures(headers)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
