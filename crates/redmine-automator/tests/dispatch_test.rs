//! Dispatch loop tests against an in-memory tracker and a fake scheduler.
//!
//! Nothing here talks to Redmine or SLURM; work directories live in a
//! temp dir.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordination::{
    BatchScheduler, JobPackage, JobType, Launcher, RoutingTable, ScriptSettings, SlurmError,
    SubjectRule, SubmissionRecord, Submitter, TrackerHandle, WorkDirManager,
};
use redmine_automator::config::StatusConfig;
use redmine_automator::dispatch::{Dispatcher, DispatcherParts};
use redmine_automator::tracker::{
    Issue, IssueTracker, IssueUpdate, NamedRef, TrackerError, Upload,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// In-memory tracker that records every update.
struct MockTracker {
    issues: Mutex<Vec<Issue>>,
    updates: Mutex<Vec<(u64, IssueUpdate)>>,
    fail_updates: AtomicBool,
    /// Number of upcoming `list_issues` calls that fail.
    list_failures: AtomicUsize,
}

impl MockTracker {
    fn new(issues: Vec<Issue>) -> Self {
        Self {
            issues: Mutex::new(issues),
            updates: Mutex::new(Vec::new()),
            fail_updates: AtomicBool::new(false),
            list_failures: AtomicUsize::new(0),
        }
    }

    fn set_status(&self, id: u64, name: &str) {
        for issue in self.issues.lock().unwrap().iter_mut() {
            if issue.id == id {
                issue.status = NamedRef {
                    id: 1,
                    name: name.into(),
                };
            }
        }
    }

    fn updates_for(&self, id: u64) -> Vec<IssueUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, u)| u.clone())
            .collect()
    }

    fn claims_for(&self, id: u64) -> usize {
        self.updates_for(id)
            .iter()
            .filter(|u| u.status_id == Some(StatusConfig::default().in_progress))
            .count()
    }
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn list_issues(&self, _project: &str) -> Result<Vec<Issue>, TrackerError> {
        let failing = self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TrackerError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(self.issues.lock().unwrap().clone())
    }

    async fn get_issue(&self, id: u64, _include_attachments: bool) -> Result<Issue, TrackerError> {
        self.issues
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(TrackerError::Status {
                status: 404,
                body: String::new(),
            })
    }

    async fn update_issue(&self, id: u64, update: IssueUpdate) -> Result<(), TrackerError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(TrackerError::Status {
                status: 503,
                body: "maintenance".into(),
            });
        }
        if let Some(status_id) = update.status_id {
            let statuses = StatusConfig::default();
            let name = if status_id == statuses.in_progress {
                "In Progress"
            } else {
                "Feedback"
            };
            for issue in self.issues.lock().unwrap().iter_mut() {
                if issue.id == id {
                    issue.status = NamedRef {
                        id: status_id,
                        name: name.into(),
                    };
                }
            }
        }
        self.updates.lock().unwrap().push((id, update));
        Ok(())
    }

    async fn upload_file(&self, path: &Path) -> Result<Upload, TrackerError> {
        let filename = path.file_name().unwrap().to_string_lossy().into_owned();
        Ok(Upload {
            token: format!("tok-{filename}"),
            filename,
            content_type: None,
        })
    }

    async fn download_attachment(&self, _id: u64, _dest: &Path) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Scheduler that hands out increasing job ids instead of calling sbatch.
struct FakeScheduler {
    submits: Mutex<Vec<(PathBuf, String)>>,
    active: Mutex<HashMap<String, String>>,
    fail: AtomicBool,
    /// Job names whose submission fails.
    fail_names: Mutex<HashSet<String>>,
    /// How long each sbatch call takes.
    delay: Mutex<Duration>,
    next_id: AtomicU64,
}

impl FakeScheduler {
    fn new() -> Self {
        Self {
            submits: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            fail_names: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1000),
        }
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

impl BatchScheduler for FakeScheduler {
    fn submit(&self, script: &Path, job_name: &str) -> Result<String, SlurmError> {
        let delay = *self.delay.lock().unwrap();
        std::thread::sleep(delay);
        if self.fail.load(Ordering::SeqCst)
            || self.fail_names.lock().unwrap().contains(job_name)
        {
            return Err(SlurmError::SubmitFailed(
                "sbatch: error: Batch job submission failed".into(),
            ));
        }
        self.submits
            .lock()
            .unwrap()
            .push((script.to_path_buf(), job_name.to_string()));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    fn find_active(&self, job_name: &str) -> Result<Option<String>, SlurmError> {
        Ok(self.active.lock().unwrap().get(job_name).cloned())
    }

    fn kind(&self) -> &'static str {
        "slurm"
    }
}

fn issue(id: u64, subject: &str, status: &str, description: &str) -> Issue {
    Issue {
        id,
        subject: subject.into(),
        description: Some(description.into()),
        status: NamedRef {
            id: 1,
            name: status.into(),
        },
        author: Some(NamedRef {
            id: 7,
            name: "Jane Requester".into(),
        }),
        assigned_to: None,
        created_on: None,
        attachments: Vec::new(),
        watchers: Vec::new(),
    }
}

fn job_types() -> Vec<JobType> {
    vec![
        JobType {
            keyword: "strainmash".into(),
            script: "strainmash.py".into(),
            cpus: 8,
            memory_mb: 12000,
        },
        JobType {
            keyword: "amrsummary".into(),
            script: "amrsummary.py".into(),
            cpus: 12,
            memory_mb: 24000,
        },
    ]
}

struct Harness {
    root: TempDir,
    tracker: Arc<MockTracker>,
    scheduler: Arc<FakeScheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl Harness {
    fn new(issues: Vec<Issue>) -> Self {
        Self::with_concurrency(issues, 1)
    }

    fn with_concurrency(issues: Vec<Issue>, max_concurrent: usize) -> Self {
        Self::build(issues, max_concurrent, Duration::from_secs(3600))
    }

    fn build(issues: Vec<Issue>, max_concurrent: usize, poll_interval: Duration) -> Self {
        let root = TempDir::new().unwrap();
        let tracker = Arc::new(MockTracker::new(issues));
        let scheduler = Arc::new(FakeScheduler::new());
        let dispatcher = Dispatcher::new(DispatcherParts {
            tracker: tracker.clone(),
            routes: RoutingTable::new(job_types(), SubjectRule::default()).unwrap(),
            workdirs: WorkDirManager::new(root.path().join("requests")),
            submitter: Submitter::new(scheduler.clone(), ScriptSettings::default()),
            launcher: Launcher {
                interpreter: "python".into(),
                automators_dir: PathBuf::from("/opt/automators"),
            },
            tracker_handle: TrackerHandle {
                base_url: "http://redmine.test".into(),
                project: "cfia".into(),
                api_key_env: "REDMINE_API_KEY".into(),
                verify_tls: true,
            },
            statuses: StatusConfig::default(),
            poll_interval,
            max_concurrent,
        });
        Self {
            root,
            tracker,
            scheduler,
            dispatcher: Arc::new(dispatcher),
        }
    }

    fn work_root(&self) -> PathBuf {
        self.root.path().join("requests")
    }

    fn work_dir(&self, id: u64) -> PathBuf {
        self.work_root().join(id.to_string())
    }
}

#[tokio::test]
async fn test_strainmash_request_is_submitted_and_claimed() {
    let h = Harness::new(vec![issue(
        276,
        "Strainmash",
        "New",
        "2014-SEQ-0276\r\n2014-SEQ-0277   ",
    )]);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.seen, 1);
    assert_eq!(report.routed, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.failed, 0);

    let submits = h.scheduler.submits.lock().unwrap().clone();
    assert_eq!(submits.len(), 1);
    let (script_path, job_name) = &submits[0];
    assert_eq!(job_name, "276");
    assert_eq!(script_path, &h.work_dir(276).join("276_slurm.sh"));

    let script = std::fs::read_to_string(script_path).unwrap();
    assert!(script.contains("#SBATCH --ntasks=8\n"));
    assert!(script.contains("#SBATCH --mem=12000\n"));
    assert!(script.contains("#SBATCH --job-name=276\n"));
    assert!(script.contains("strainmash.py --package"));

    let package = JobPackage::load(h.work_dir(276).join("job_package.json")).unwrap();
    assert_eq!(package.job_type, "strainmash");
    assert_eq!(package.issue.id, 276);
    assert_eq!(package.description, vec!["2014-SEQ-0276", "2014-SEQ-0277"]);

    let updates = h.tracker.updates_for(276);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, Some(2));
    let note = updates[0].notes.as_deref().unwrap();
    assert!(note.contains("STRAINMASH"));
    assert!(note.contains("submitted"));
    assert!(note.contains("1000"));

    let record = SubmissionRecord::load(&WorkDirManager::new(h.work_root()).work_dir(276))
        .unwrap()
        .unwrap();
    assert_eq!(record.job_id, "1000");
    assert_eq!(record.package_id, Some(package.package_id));
}

#[tokio::test]
async fn test_issues_past_new_are_never_routed() {
    let h = Harness::new(vec![
        issue(1, "strainmash", "In Progress", ""),
        issue(2, "amrsummary", "Resolved", ""),
        issue(3, "strainmash", "Feedback", ""),
    ]);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.seen, 3);
    assert_eq!(report.new, 0);
    assert_eq!(report.routed, 0);
    assert_eq!(h.scheduler.submit_count(), 0);
    assert!(h.tracker.updates.lock().unwrap().is_empty());
    assert!(!h.work_root().exists());
}

#[tokio::test]
async fn test_unknown_subject_is_left_alone() {
    let h = Harness::new(vec![issue(50, "Please make coffee", "New", "")]);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.new, 1);
    assert_eq!(report.routed, 0);
    assert!(!h.work_dir(50).exists());
    assert!(h.tracker.updates_for(50).is_empty());
    assert_eq!(h.scheduler.submit_count(), 0);
}

#[tokio::test]
async fn test_submission_failure_posts_note_without_claiming() {
    let h = Harness::new(vec![issue(60, "amrsummary", "New", "2015-SEQ-0001")]);
    h.scheduler.fail.store(true, Ordering::SeqCst);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.submitted, 0);

    let updates = h.tracker.updates_for(60);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, None);
    assert!(updates[0]
        .notes
        .as_deref()
        .unwrap()
        .contains("could not be submitted"));
    assert!(!h.work_dir(60).join("submission.json").exists());

    // Scheduler back; the issue is still New and goes through.
    h.scheduler.fail.store(false, Ordering::SeqCst);
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(h.scheduler.submit_count(), 1);
    assert_eq!(h.tracker.claims_for(60), 1);
}

#[tokio::test]
async fn test_existing_work_dir_is_reused_after_crash() {
    let h = Harness::new(vec![issue(300, "strainmash", "New", "2014-SEQ-0300")]);

    // A previous run got as far as the work dir and a package, then died.
    let manager = WorkDirManager::new(h.work_root());
    let dir = manager.ensure_work_dir(300).unwrap();
    std::fs::write(dir.package_path(), "{\"format_version\": 1}").unwrap();

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.failed, 0);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.routed, 0);
    assert_eq!(h.scheduler.submit_count(), 1);
    assert_eq!(h.tracker.claims_for(300), 1);
}

#[tokio::test]
async fn test_submission_record_prevents_resubmission() {
    let h = Harness::new(vec![issue(310, "strainmash", "New", "")]);

    // Job submitted, but the claim never reached the tracker.
    h.tracker.fail_updates.store(true, Ordering::SeqCst);
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.scheduler.submit_count(), 1);
    assert!(h.work_dir(310).join("submission.json").exists());

    h.tracker.fail_updates.store(false, Ordering::SeqCst);
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.submitted, 0);
    assert_eq!(h.scheduler.submit_count(), 1);

    let updates = h.tracker.updates_for(310);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, Some(2));
    assert!(updates[0].notes.as_deref().unwrap().contains("1000"));
}

#[tokio::test]
async fn test_live_job_without_record_is_adopted() {
    let h = Harness::new(vec![issue(320, "amrsummary", "New", "")]);
    h.scheduler
        .active
        .lock()
        .unwrap()
        .insert("320".into(), "4242".into());

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(h.scheduler.submit_count(), 0);

    let record = SubmissionRecord::load(&WorkDirManager::new(h.work_root()).work_dir(320))
        .unwrap()
        .unwrap();
    assert_eq!(record.job_id, "4242");
    assert_eq!(record.package_id, None);
    assert!(h.tracker.updates_for(320)[0]
        .notes
        .as_deref()
        .unwrap()
        .contains("4242"));
}

#[tokio::test]
async fn test_duplicate_listing_submits_once() {
    let h = Harness::new(vec![
        issue(400, "strainmash", "New", ""),
        issue(400, "strainmash", "New", ""),
    ]);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.routed, 1);
    assert_eq!(h.scheduler.submit_count(), 1);
}

#[tokio::test]
async fn test_concurrent_cycle_handles_every_issue() {
    let issues = (500..506)
        .map(|id| issue(id, "strainmash", "New", ""))
        .collect();
    let h = Harness::with_concurrency(issues, 3);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 6);
    assert_eq!(h.scheduler.submit_count(), 6);

    let mut names: Vec<String> = h
        .scheduler
        .submits
        .lock()
        .unwrap()
        .iter()
        .map(|(_, name)| name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["500", "501", "502", "503", "504", "505"]);
    for id in 500..506 {
        assert_eq!(h.tracker.claims_for(id), 1);
    }
}

#[tokio::test]
async fn test_work_dir_failure_sets_error_status() {
    let h = Harness::new(vec![issue(600, "strainmash", "New", "")]);
    std::fs::create_dir_all(h.work_root()).unwrap();
    // A plain file where the work directory should be.
    std::fs::write(h.work_dir(600), "not a directory").unwrap();

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.scheduler.submit_count(), 0);

    let updates = h.tracker.updates_for(600);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, Some(StatusConfig::default().error));
    assert!(updates[0]
        .notes
        .as_deref()
        .unwrap()
        .contains("could not be prepared"));
}

#[tokio::test]
async fn test_run_stops_when_cancelled() {
    let h = Harness::new(vec![issue(700, "strainmash", "New", "")]);
    let cancel = CancellationToken::new();

    let dispatcher = h.dispatcher.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { dispatcher.run(token).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch loop did not stop")
        .unwrap();

    assert_eq!(h.scheduler.submit_count(), 1);
}

#[tokio::test]
async fn test_reopened_issue_is_submitted_again() {
    let h = Harness::new(vec![issue(800, "strainmash", "New", "2014-SEQ-0800")]);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 1);
    let record = SubmissionRecord::load(&WorkDirManager::new(h.work_root()).work_dir(800))
        .unwrap()
        .unwrap();
    assert!(record.claimed);

    // The requester puts the finished issue back to New.
    h.tracker.set_status(800, "New");
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.resumed, 0);
    assert_eq!(h.scheduler.submit_count(), 2);
    assert_eq!(h.tracker.claims_for(800), 2);

    let record = SubmissionRecord::load(&WorkDirManager::new(h.work_root()).work_dir(800))
        .unwrap()
        .unwrap();
    assert_eq!(record.job_id, "1001");
    assert!(h.work_dir(800).join("submission.1000.json").exists());
    assert!(h.tracker.updates_for(800)[1]
        .notes
        .as_deref()
        .unwrap()
        .contains("1001"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_submissions_overlap() {
    let issues = (810..814)
        .map(|id| issue(id, "strainmash", "New", ""))
        .collect();
    let h = Harness::with_concurrency(issues, 4);
    *h.scheduler.delay.lock().unwrap() = Duration::from_millis(300);

    let started = Instant::now();
    let report = h.dispatcher.run_cycle().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.submitted, 4);
    // Back to back this would take 1.2s.
    assert!(elapsed < Duration::from_millis(1100), "took {elapsed:?}");
}

#[tokio::test]
async fn test_failing_issue_does_not_block_others() {
    let h = Harness::with_concurrency(
        vec![
            issue(820, "strainmash", "New", ""),
            issue(821, "amrsummary", "New", ""),
        ],
        2,
    );
    h.scheduler.fail_names.lock().unwrap().insert("820".into());

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(h.tracker.claims_for(820), 0);
    assert_eq!(h.tracker.claims_for(821), 1);
    assert_eq!(h.scheduler.submits.lock().unwrap()[0].1, "821");
}

#[tokio::test]
async fn test_package_failure_sets_error_status() {
    let h = Harness::new(vec![issue(830, "strainmash", "New", "")]);
    // A directory where the package file should go.
    std::fs::create_dir_all(h.work_dir(830).join("job_package.json")).unwrap();

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.scheduler.submit_count(), 0);

    let updates = h.tracker.updates_for(830);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, Some(StatusConfig::default().error));
    assert!(updates[0]
        .notes
        .as_deref()
        .unwrap()
        .contains("could not be prepared"));
}

#[tokio::test]
async fn test_corrupt_submission_record_needs_attention() {
    let h = Harness::new(vec![issue(840, "strainmash", "New", "")]);
    std::fs::create_dir_all(h.work_dir(840)).unwrap();
    std::fs::write(h.work_dir(840).join("submission.json"), "{ not json").unwrap();

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.scheduler.submit_count(), 0);

    let updates = h.tracker.updates_for(840);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status_id, Some(StatusConfig::default().error));
}

#[tokio::test]
async fn test_repeated_submit_failure_is_reported_once() {
    let h = Harness::new(vec![issue(850, "strainmash", "New", "")]);
    h.scheduler.fail.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
    }
    assert_eq!(h.tracker.updates_for(850).len(), 1);
    assert!(h.work_dir(850).join(".submit_failure_noted").exists());

    h.scheduler.fail.store(false, Ordering::SeqCst);
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(h.tracker.claims_for(850), 1);
    assert!(!h.work_dir(850).join(".submit_failure_noted").exists());
}

#[tokio::test]
async fn test_run_survives_list_failure() {
    let h = Harness::build(
        vec![issue(860, "strainmash", "New", "")],
        1,
        Duration::from_millis(20),
    );
    h.tracker.list_failures.store(1, Ordering::SeqCst);
    let cancel = CancellationToken::new();

    let dispatcher = h.dispatcher.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { dispatcher.run(token).await });

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.scheduler.submit_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch loop did not stop")
        .unwrap();

    assert_eq!(h.tracker.list_failures.load(Ordering::SeqCst), 0);
    assert_eq!(h.scheduler.submit_count(), 1);
    assert_eq!(h.tracker.claims_for(860), 1);
}
