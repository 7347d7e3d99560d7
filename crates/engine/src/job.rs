use std::fmt;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::format::OutputFormat;

/// Progress value reserved for "conversion failed, no result available"
pub const PROGRESS_FAILED: i32 = -1;
/// Progress value of a job whose output is closed and ready for download
pub const PROGRESS_COMPLETE: i32 = 100;
/// Display name reported for jobs that never had one set
pub const DEFAULT_DISPLAY_NAME: &str = "converted";

/// Opaque identifier of a conversion job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

/// Coarse lifecycle state derived from the progress value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

/// Mutable state of one job, only ever touched under the registry's per-key lock
#[derive(Debug, Clone)]
struct Job {
    progress: i32,
    display_name: Option<String>,
    result_path: Option<PathBuf>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Job {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            progress: 0,
            display_name: None,
            result_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.progress == PROGRESS_COMPLETE && self.result_path.is_some()
    }

    fn snapshot(&self) -> JobStatus {
        JobStatus {
            progress: self.progress,
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            result_path: self.result_path.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of a job's state, as seen by polling clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub progress: i32,
    pub display_name: String,
    pub result_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self.progress {
            PROGRESS_FAILED => JobState::Failed,
            PROGRESS_COMPLETE if self.result_path.is_some() => JobState::Completed,
            _ => JobState::Running,
        }
    }

    /// User-facing file name of the finished artifact: display name plus the format's extension
    pub fn download_file_name(&self, format: OutputFormat) -> String {
        format!("{}.{}", self.display_name, format.extension())
    }
}

/// Process-wide store of job state keyed by job id.
///
/// Every operation takes the lock of a single map shard, so updates to one job
/// are atomic with respect to readers of that job and never wait on work for
/// jobs in other shards. Updates addressed to an unknown id are ignored: a late
/// progress report racing a download-and-remove must not resurrect the job.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job. An existing entry with the same id is replaced.
    pub fn create_job(&self, id: &JobId) {
        self.jobs.insert(id.clone(), Job::new());
    }

    /// Returns `false` if the job does not exist
    pub fn set_display_name(&self, id: &JobId, name: impl Into<String>) -> bool {
        self.update(id, |job| job.display_name = Some(name.into()))
    }

    /// Overwrite the progress value. Monotonicity is the writer's responsibility.
    pub fn set_progress(&self, id: &JobId, progress: i32) -> bool {
        self.update(id, |job| job.progress = progress)
    }

    /// Mark the job failed (progress -1)
    pub fn set_failed(&self, id: &JobId) -> bool {
        self.set_progress(id, PROGRESS_FAILED)
    }

    /// Record the finished artifact and set progress to 100 in one step
    pub fn set_completed(&self, id: &JobId, result_path: PathBuf) -> bool {
        self.update(id, |job| {
            job.progress = PROGRESS_COMPLETE;
            job.result_path = Some(result_path);
        })
    }

    pub fn get_status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|job| job.snapshot())
    }

    /// Forget a job. Removing an unknown id is a no-op.
    pub fn remove_job(&self, id: &JobId) -> bool {
        self.jobs.remove(id).is_some()
    }

    /// Remove the job only if it is complete, returning its final snapshot.
    ///
    /// Check and removal happen under the same lock, so two concurrent claims
    /// cannot both receive the artifact.
    pub fn claim_result(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs
            .remove_if(id, |_, job| job.is_complete())
            .map(|(_, job)| job.snapshot())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn update(&self, id: &JobId, apply: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut job) => {
                apply(&mut job);
                job.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}
