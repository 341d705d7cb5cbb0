//! Redmine issue tracker client.
//!
//! The dispatcher and the report helpers only see the [`IssueTracker`] trait;
//! [`RedmineClient`] is the REST/JSON implementation used in production.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordination::package::AttachmentRef;
use coordination::{IssueHandle, TrackerHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `{id, name}` pair Redmine uses for statuses, users and projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub filename: String,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub content_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: NamedRef,
    #[serde(default)]
    pub author: Option<NamedRef>,
    #[serde(default)]
    pub assigned_to: Option<NamedRef>,
    #[serde(default)]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub watchers: Vec<NamedRef>,
}

impl Issue {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    pub fn handle(&self) -> IssueHandle {
        IssueHandle {
            id: self.id,
            subject: self.subject.clone(),
            author: self.author.as_ref().map(|a| a.name.clone()),
            attachments: self
                .attachments
                .iter()
                .map(|a| AttachmentRef {
                    id: a.id,
                    filename: a.filename.clone(),
                })
                .collect(),
        }
    }

    /// Plain-text dump kept in the work directory for whoever debugs the job.
    pub fn details_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("id: {}\n", self.id));
        out.push_str(&format!("subject: {}\n", self.subject));
        out.push_str(&format!("status: {} ({})\n", self.status.name, self.status.id));
        if let Some(author) = &self.author {
            out.push_str(&format!("author: {} ({})\n", author.name, author.id));
        }
        if let Some(assignee) = &self.assigned_to {
            out.push_str(&format!("assigned_to: {} ({})\n", assignee.name, assignee.id));
        }
        if let Some(created) = &self.created_on {
            out.push_str(&format!("created_on: {}\n", created.to_rfc3339()));
        }
        for attachment in &self.attachments {
            out.push_str(&format!(
                "attachment: {} ({}, {} bytes)\n",
                attachment.filename, attachment.id, attachment.filesize
            ));
        }
        for watcher in &self.watchers {
            out.push_str(&format!("watcher: {} ({})\n", watcher.name, watcher.id));
        }
        out.push_str("description:\n");
        out.push_str(self.description());
        out.push('\n');
        out
    }
}

/// Token returned by `POST /uploads.json`, attached to an issue by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub token: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Changes applied by `update_issue`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssueUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uploads: Vec<Upload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_user_ids: Option<Vec<u64>>,
}

impl IssueUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status_id: u64) -> Self {
        self.status_id = Some(status_id);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn upload(mut self, upload: Upload) -> Self {
        self.uploads.push(upload);
        self
    }

    pub fn assign_to(mut self, user_id: u64) -> Self {
        self.assigned_to_id = Some(user_id);
        self
    }

    pub fn watchers(mut self, user_ids: Vec<u64>) -> Self {
        self.watcher_user_ids = Some(user_ids);
        self
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracker returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Attachment {0} has no content URL")]
    MissingContentUrl(u64),

    #[error("API key variable {0} is not set")]
    MissingApiKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// Network trouble and server errors; worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Operations the automator needs from the issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// All open issues of a project, across pages.
    async fn list_issues(&self, project: &str) -> Result<Vec<Issue>, TrackerError>;

    async fn get_issue(&self, id: u64, include_attachments: bool) -> Result<Issue, TrackerError>;

    async fn update_issue(&self, id: u64, update: IssueUpdate) -> Result<(), TrackerError>;

    /// Upload a file and return the token to reference it in an update.
    async fn upload_file(&self, path: &Path) -> Result<Upload, TrackerError>;

    async fn download_attachment(&self, attachment_id: u64, dest: &Path)
        -> Result<(), TrackerError>;
}

const PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct IssuesPage {
    issues: Vec<Issue>,
    #[serde(default)]
    total_count: usize,
}

#[derive(Deserialize)]
struct IssueEnvelope {
    issue: Issue,
}

#[derive(Serialize)]
struct UpdateEnvelope<'a> {
    issue: &'a IssueUpdate,
}

#[derive(Deserialize)]
struct UploadEnvelope {
    upload: UploadToken,
}

#[derive(Deserialize)]
struct UploadToken {
    token: String,
}

#[derive(Deserialize)]
struct AttachmentEnvelope {
    attachment: Attachment,
}

/// Redmine REST client authenticated with an API key.
pub struct RedmineClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RedmineClient {
    pub fn new(
        base_url: &str,
        api_key: String,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Rebuild a client from a job package's tracker handle, reading the API
    /// key from the environment variable the handle names.
    pub fn from_handle(handle: &TrackerHandle, timeout: Duration) -> Result<Self, TrackerError> {
        let api_key = std::env::var(&handle.api_key_env)
            .map_err(|_| TrackerError::MissingApiKey(handle.api_key_env.clone()))?;
        Self::new(&handle.base_url, api_key, timeout, handle.verify_tls)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TrackerError::Status {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }
}

#[async_trait]
impl IssueTracker for RedmineClient {
    async fn list_issues(&self, project: &str) -> Result<Vec<Issue>, TrackerError> {
        let mut issues = Vec::new();
        let mut offset = 0usize;
        loop {
            let resp = self
                .http
                .get(self.url("/issues.json"))
                .header("X-Redmine-API-Key", &self.api_key)
                .query(&[
                    ("project_id", project.to_string()),
                    ("status_id", "open".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                ])
                .send()
                .await?;
            let page: IssuesPage = Self::check(resp).await?.json().await?;
            let fetched = page.issues.len();
            issues.extend(page.issues);
            offset += fetched;
            if fetched == 0 || offset >= page.total_count {
                break;
            }
        }
        tracing::debug!(project, count = issues.len(), "Listed issues");
        Ok(issues)
    }

    async fn get_issue(&self, id: u64, include_attachments: bool) -> Result<Issue, TrackerError> {
        let include = if include_attachments {
            "attachments,watchers"
        } else {
            "watchers"
        };
        let resp = self
            .http
            .get(self.url(&format!("/issues/{id}.json")))
            .header("X-Redmine-API-Key", &self.api_key)
            .query(&[("include", include)])
            .send()
            .await?;
        let envelope: IssueEnvelope = Self::check(resp).await?.json().await?;
        Ok(envelope.issue)
    }

    async fn update_issue(&self, id: u64, update: IssueUpdate) -> Result<(), TrackerError> {
        let resp = self
            .http
            .put(self.url(&format!("/issues/{id}.json")))
            .header("X-Redmine-API-Key", &self.api_key)
            .json(&UpdateEnvelope { issue: &update })
            .send()
            .await?;
        Self::check(resp).await?;
        tracing::debug!(issue = id, status = ?update.status_id, "Updated issue");
        Ok(())
    }

    async fn upload_file(&self, path: &Path) -> Result<Upload, TrackerError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = tokio::fs::read(path).await?;

        let resp = self
            .http
            .post(self.url("/uploads.json"))
            .header("X-Redmine-API-Key", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .query(&[("filename", filename.as_str())])
            .body(bytes)
            .send()
            .await?;
        let envelope: UploadEnvelope = Self::check(resp).await?.json().await?;
        Ok(Upload {
            token: envelope.upload.token,
            filename,
            content_type: None,
        })
    }

    async fn download_attachment(
        &self,
        attachment_id: u64,
        dest: &Path,
    ) -> Result<(), TrackerError> {
        let resp = self
            .http
            .get(self.url(&format!("/attachments/{attachment_id}.json")))
            .header("X-Redmine-API-Key", &self.api_key)
            .send()
            .await?;
        let envelope: AttachmentEnvelope = Self::check(resp).await?.json().await?;
        let content_url = envelope
            .attachment
            .content_url
            .ok_or(TrackerError::MissingContentUrl(attachment_id))?;

        let resp = self
            .http
            .get(&content_url)
            .header("X-Redmine-API-Key", &self.api_key)
            .send()
            .await?;
        let bytes = Self::check(resp).await?.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        tracing::debug!(attachment = attachment_id, dest = %dest.display(), "Downloaded attachment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUE_JSON: &str = r#"{
        "issue": {
            "id": 4242,
            "project": {"id": 1, "name": "CFIA"},
            "status": {"id": 1, "name": "New"},
            "author": {"id": 7, "name": "Jane Analyst"},
            "subject": "strainmash",
            "description": "2014-SEQ-0276\r\n2014-SEQ-0277",
            "created_on": "2018-07-12T15:03:51Z",
            "attachments": [
                {"id": 99, "filename": "seqids.txt", "filesize": 27,
                 "content_url": "http://redmine/attachments/download/99/seqids.txt"}
            ]
        }
    }"#;

    #[test]
    fn test_issue_deserializes() {
        let envelope: IssueEnvelope = serde_json::from_str(ISSUE_JSON).unwrap();
        let issue = envelope.issue;
        assert_eq!(issue.id, 4242);
        assert_eq!(issue.status.name, "New");
        assert_eq!(issue.description(), "2014-SEQ-0276\r\n2014-SEQ-0277");
        assert_eq!(issue.attachments[0].id, 99);
        assert!(issue.watchers.is_empty());

        let handle = issue.handle();
        assert_eq!(handle.author.as_deref(), Some("Jane Analyst"));
        assert_eq!(handle.attachments[0].filename, "seqids.txt");
    }

    #[test]
    fn test_null_description() {
        let issue: Issue = serde_json::from_str(
            r#"{"id": 1, "subject": "x", "description": null, "status": {"id": 1, "name": "New"}}"#,
        )
        .unwrap();
        assert_eq!(issue.description(), "");
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let update = IssueUpdate::new().status(2).notes("submitted");
        let json = serde_json::to_value(UpdateEnvelope { issue: &update }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"issue": {"status_id": 2, "notes": "submitted"}})
        );

        let update = IssueUpdate::new()
            .upload(Upload {
                token: "7167.ed1ccdb093229ca1bd0b043618d88743".into(),
                filename: "report.pdf".into(),
                content_type: None,
            })
            .assign_to(5)
            .watchers(vec![5, 6]);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["uploads"][0]["filename"], "report.pdf");
        assert_eq!(json["assigned_to_id"], 5);
        assert_eq!(json["watcher_user_ids"], serde_json::json!([5, 6]));
        assert!(json.get("status_id").is_none());
    }

    #[test]
    fn test_details_text() {
        let envelope: IssueEnvelope = serde_json::from_str(ISSUE_JSON).unwrap();
        let text = envelope.issue.details_text();
        assert!(text.starts_with("id: 4242\nsubject: strainmash\nstatus: New (1)\n"));
        assert!(text.contains("attachment: seqids.txt (99, 27 bytes)"));
        assert!(text.ends_with("2014-SEQ-0277\n"));
    }

    #[test]
    fn test_transient_classification() {
        let err = TrackerError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_transient());
        let err = TrackerError::Status {
            status: 422,
            body: "Status is invalid".into(),
        };
        assert!(!err.is_transient());
        assert!(!TrackerError::MissingApiKey("REDMINE_API_KEY".into()).is_transient());
    }

    #[test]
    fn test_from_handle_requires_key() {
        let handle = TrackerHandle {
            base_url: "http://redmine.example".into(),
            project: "cfia".into(),
            api_key_env: "REDMINE_AUTOMATOR_TEST_UNSET_KEY".into(),
            verify_tls: false,
        };
        assert!(matches!(
            RedmineClient::from_handle(&handle, Duration::from_secs(1)),
            Err(TrackerError::MissingApiKey(_))
        ));
    }
}
