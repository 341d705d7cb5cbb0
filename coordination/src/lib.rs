//! Job coordination for the Redmine automator.
//!
//! This library holds everything between "an issue was accepted" and "a
//! batch job is queued", independent of the issue tracker:
//!
//! - [`routing`]: subject keyword → job type table
//! - [`workdir`]: per-issue work directories
//! - [`package`]: versioned job package and the automation command line
//! - [`slurm`]: batch script rendering and scheduler back ends
//! - [`submission`]: submission with an idempotency record
//! - [`transfer`]: FTP upload with bounded, stall-tolerant retry

pub mod package;
pub mod routing;
pub mod slurm;
pub mod submission;
pub mod transfer;
pub mod workdir;

pub use package::{
    parse_description, AutomationCommand, IssueHandle, JobPackage, Launcher, PackageError,
    TrackerHandle,
};
pub use routing::{normalize_subject, JobType, RoutingError, RoutingTable, SubjectRule};
pub use slurm::{BatchScheduler, LocalShellScheduler, SlurmConfig, SlurmError, SlurmScheduler};
pub use submission::{ScriptSettings, SubmissionError, SubmissionOutcome, SubmissionRecord, Submitter};
pub use transfer::{upload_with_retry, CurlFtp, FtpTarget, RemoteStore, RetryPolicy, TransferError};
pub use workdir::{WorkDir, WorkDirError, WorkDirManager};
