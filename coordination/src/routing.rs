//! Keyword Router: maps an issue subject to a registered job type.
//!
//! Routing is a declarative table loaded from configuration: each entry
//! names the normalized subject keyword, the automation script that handles
//! it, and the Slurm resource profile the job asks for. New job types are
//! added by editing the table, never by adding code.
//!
//! Lookup is exact string match on the normalized subject. There is no fuzzy
//! matching; an unknown subject routes to `None` and the issue is left alone.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One routable job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobType {
    /// Subject keyword, e.g. `strainmash`. Normalized when the table is built.
    pub keyword: String,
    /// Automation script identifier, resolved relative to the launcher's
    /// script directory (e.g. `strainmash.py`).
    pub script: String,
    /// Value for `#SBATCH --ntasks`.
    pub cpus: u32,
    /// Value for `#SBATCH --mem`, in MB.
    pub memory_mb: u64,
}

/// How subjects are normalized before lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRule {
    /// Also drop ASCII punctuation (underscores are kept).
    #[serde(default)]
    pub strip_punctuation: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Job type keyword '{0}' is empty after normalization")]
    EmptyKeyword(String),

    #[error("Duplicate job type keyword '{0}'")]
    DuplicateKeyword(String),

    #[error("Job type '{keyword}' has an invalid resource profile: {reason}")]
    InvalidProfile { keyword: String, reason: String },
}

/// Lowercase the subject and remove whitespace (and punctuation, if the rule
/// says so).
pub fn normalize_subject(subject: &str, rule: SubjectRule) -> String {
    subject
        .chars()
        .filter(|c| !c.is_whitespace())
        .filter(|c| !(rule.strip_punctuation && c.is_ascii_punctuation() && *c != '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Immutable keyword → job type table.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rule: SubjectRule,
    routes: HashMap<String, JobType>,
}

impl RoutingTable {
    /// Build a table, normalizing every keyword with the same rule used for
    /// subjects.
    pub fn new(
        job_types: impl IntoIterator<Item = JobType>,
        rule: SubjectRule,
    ) -> Result<Self, RoutingError> {
        let mut routes = HashMap::new();
        for mut job_type in job_types {
            let keyword = normalize_subject(&job_type.keyword, rule);
            if keyword.is_empty() {
                return Err(RoutingError::EmptyKeyword(job_type.keyword));
            }
            if job_type.cpus == 0 {
                return Err(RoutingError::InvalidProfile {
                    keyword,
                    reason: "cpus must be at least 1".into(),
                });
            }
            if job_type.memory_mb == 0 {
                return Err(RoutingError::InvalidProfile {
                    keyword,
                    reason: "memory_mb must be at least 1".into(),
                });
            }
            if job_type.script.trim().is_empty() {
                return Err(RoutingError::InvalidProfile {
                    keyword,
                    reason: "script must not be empty".into(),
                });
            }
            job_type.keyword = keyword.clone();
            if routes.insert(keyword.clone(), job_type).is_some() {
                return Err(RoutingError::DuplicateKeyword(keyword));
            }
        }
        Ok(Self { rule, routes })
    }

    /// Look up the job type for an issue subject.
    pub fn route(&self, subject: &str) -> Option<&JobType> {
        let key = normalize_subject(subject, self.rule);
        self.routes.get(&key)
    }

    pub fn rule(&self) -> SubjectRule {
        self.rule
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Job types sorted by keyword, for display.
    pub fn job_types(&self) -> Vec<&JobType> {
        let mut all: Vec<&JobType> = self.routes.values().collect();
        all.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        all
    }
}
