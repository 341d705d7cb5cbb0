use anyhow::{bail, Context, Result};
use coordination::{
    FtpTarget, JobType, Launcher, RetryPolicy, RoutingTable, ScriptSettings, SubjectRule,
    TrackerHandle,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Issue tracker connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub url: String,
    pub project: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_tracker_timeout")]
    pub timeout_secs: u64,
    /// The on-site Redmine serves a self-signed certificate.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// Tracker status ids. These are configured per Redmine instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Status name an issue must have to be picked up.
    pub new_name: String,
    pub in_progress: u64,
    pub resolved: u64,
    pub feedback: u64,
    /// Status set when an issue cannot be processed at all.
    pub error: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            new_name: "New".into(),
            in_progress: 2,
            resolved: 3,
            feedback: 4,
            error: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub poll_interval_secs: u64,
    pub work_root: PathBuf,
    /// Issues handled concurrently within one poll cycle.
    pub max_concurrent_issues: usize,
    pub strip_punctuation: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            work_root: PathBuf::from("/mnt/nas/bio_requests"),
            max_concurrent_issues: 1,
            strip_punctuation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Slurm,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    pub time_limit: String,
    /// Environment activation script sourced before the automation command.
    pub activation: Option<PathBuf>,
    pub partition: Option<String>,
    /// SSH host running the Slurm controller; unset means run sbatch locally.
    pub slurm_host: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Slurm,
            time_limit: coordination::slurm::DEFAULT_TIME_LIMIT.into(),
            activation: None,
            partition: None,
            slurm_host: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    pub directory: String,
    #[serde(default = "default_ftp_user_env")]
    pub user_env: String,
    #[serde(default = "default_ftp_password_env")]
    pub password_env: String,
    #[serde(default = "default_ftp_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_ftp_attempts")]
    pub max_attempts: u32,
}

impl FtpConfig {
    /// Resolve credentials from the environment.
    pub fn target(&self) -> Result<FtpTarget> {
        let user = std::env::var(&self.user_env)
            .with_context(|| format!("FTP user variable {} is not set", self.user_env))?;
        let password = std::env::var(&self.password_env)
            .with_context(|| format!("FTP password variable {} is not set", self.password_env))?;
        Ok(FtpTarget {
            host: self.host.clone(),
            directory: self.directory.clone(),
            user,
            password,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
        }
    }
}

/// Top-level automator configuration, read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomatorConfig {
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub statuses: StatusConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub launcher: Launcher,
    #[serde(default)]
    pub ftp: Option<FtpConfig>,
    #[serde(default)]
    pub job_types: Vec<JobType>,
}

impl AutomatorConfig {
    /// Load from a file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override selected settings from environment-style lookups.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDMINE_URL").filter(|s| !s.is_empty()) {
            self.tracker.url = url;
        }
        if let Some(project) = lookup("REDMINE_PROJECT").filter(|s| !s.is_empty()) {
            self.tracker.project = project;
        }
        if let Some(secs) = lookup("AUTOMATOR_POLL_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.dispatch.poll_interval_secs = secs;
        }
        if let Some(root) = lookup("AUTOMATOR_WORK_ROOT").filter(|s| !s.is_empty()) {
            self.dispatch.work_root = PathBuf::from(root);
        }
        // SLURM_HOST: empty or "local" means run sbatch directly
        if let Some(host) = lookup("SLURM_HOST") {
            self.scheduler.slurm_host = Some(host).filter(|s| !s.is_empty() && s != "local");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.url.trim().is_empty() {
            bail!("tracker.url must not be empty");
        }
        if self.tracker.project.trim().is_empty() {
            bail!("tracker.project must not be empty");
        }
        if self.dispatch.poll_interval_secs == 0 {
            bail!("dispatch.poll_interval_secs must be at least 1");
        }
        if self.dispatch.max_concurrent_issues == 0 {
            bail!("dispatch.max_concurrent_issues must be at least 1");
        }
        if self.job_types.is_empty() {
            bail!("at least one [[job_types]] entry is required");
        }
        if let Some(ftp) = &self.ftp {
            if ftp.max_attempts == 0 {
                bail!("ftp.max_attempts must be at least 1");
            }
        }
        self.routing_table()?;
        Ok(())
    }

    pub fn routing_table(&self) -> Result<RoutingTable> {
        let rule = SubjectRule {
            strip_punctuation: self.dispatch.strip_punctuation,
        };
        RoutingTable::new(self.job_types.iter().cloned(), rule).context("Invalid job type table")
    }

    pub fn tracker_handle(&self) -> TrackerHandle {
        TrackerHandle {
            base_url: self.tracker.url.clone(),
            project: self.tracker.project.clone(),
            api_key_env: self.tracker.api_key_env.clone(),
            verify_tls: self.tracker.verify_tls,
        }
    }

    pub fn script_settings(&self) -> ScriptSettings {
        ScriptSettings {
            time_limit: self.scheduler.time_limit.clone(),
            partition: self.scheduler.partition.clone(),
            activation: self.scheduler.activation.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.poll_interval_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker.timeout_secs)
    }
}

fn default_api_key_env() -> String {
    "REDMINE_API_KEY".into()
}

fn default_tracker_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_ftp_user_env() -> String {
    "FTP_USERNAME".into()
}

fn default_ftp_password_env() -> String {
    "FTP_PASSWORD".into()
}

fn default_ftp_timeout() -> u64 {
    30
}

fn default_ftp_attempts() -> u32 {
    10
}
