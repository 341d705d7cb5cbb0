//! Redmine automator: polls a Redmine project for new automation requests,
//! packages each one, and submits it to a batch scheduler.

pub mod config;
pub mod dispatch;
pub mod report;
pub mod tracker;

pub use config::AutomatorConfig;
pub use dispatch::{CycleReport, DispatchError, Dispatcher, DispatcherParts, IssueOutcome};
pub use tracker::{Issue, IssueTracker, IssueUpdate, RedmineClient, TrackerError};
