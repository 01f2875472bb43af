//! Job controller: the in-memory job map, its on-disk mirror, and the
//! cancellation handles.
//!
//! Status only moves forward; complete/cancelled/error are terminal. Jobs
//! persisted as queued or running load back as `interrupted` — the work
//! they represent did not survive the restart, but the cache did, so a
//! `resume` re-runs the upload cheaply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Message shown for jobs that were in flight when the server stopped.
pub const INTERRUPTED_MESSAGE: &str =
    "This job was interrupted because the server restarted. Resume to run again.";

#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Cancelled,
    Error,
    /// Assigned on startup to jobs that were queued/running at shutdown.
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::Error
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Error | JobStatus::Interrupted
        )
    }
}

/// One batch job. Serialized fields are exactly the ones that survive a
/// restart; the progress log and preview are rebuilt per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub status: JobStatus,
    pub upload_path: String,
    pub result_path: Option<String>,
    pub total: usize,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub filename: String,
    pub created_at: String,
    #[serde(skip)]
    pub progress: Vec<serde_json::Value>,
    #[serde(skip)]
    pub preview_rows: Option<serde_json::Value>,
}

impl Job {
    pub fn new(upload_path: String, total: usize, filename: String) -> Job {
        Job {
            status: JobStatus::Queued,
            upload_path,
            result_path: None,
            total,
            error: None,
            summary: None,
            filename,
            created_at: now_stamp(),
            progress: vec![],
            preview_rows: None,
        }
    }
}

pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// 8-character random id for jobs and FSBO searches.
pub fn new_job_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Owns the job map, its persistence, and the in-flight task handles.
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    jobs_file: PathBuf,
}

impl JobStore {
    /// Load persisted jobs, rewriting any that were in flight at shutdown
    /// to `interrupted`.
    pub fn load(jobs_file: impl AsRef<Path>) -> JobStore {
        let jobs_file = jobs_file.as_ref().to_owned();
        let mut jobs: HashMap<String, Job> = match std::fs::read_to_string(&jobs_file) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("could not parse {}: {}", jobs_file.display(), err);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        for job in jobs.values_mut() {
            if job.status.is_active() {
                job.status = JobStatus::Interrupted;
                job.error = Some(INTERRUPTED_MESSAGE.to_owned());
            }
        }

        let store = JobStore {
            jobs: Mutex::new(jobs),
            tasks: Mutex::new(HashMap::new()),
            jobs_file,
        };
        store.save();
        store
    }

    /// Persist the non-transient job state. Failures are logged, not
    /// fatal; the in-memory map stays authoritative.
    pub fn save(&self) {
        let snapshot = {
            let jobs = self.jobs.lock().unwrap();
            serde_json::to_string_pretty(&*jobs)
        };
        let result: Result<()> = snapshot
            .context("could not serialize jobs")
            .and_then(|raw| {
                if let Some(parent) = self.jobs_file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.jobs_file, raw)?;
                Ok(())
            });
        if let Err(err) = result {
            warn!("could not persist jobs: {}", err);
        }
    }

    pub fn insert(&self, job_id: &str, job: Job) {
        self.jobs.lock().unwrap().insert(job_id.to_owned(), job);
        self.save();
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(job_id)
    }

    /// Apply a mutation to a job, then persist. Returns false when the
    /// job does not exist.
    pub fn update<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let found = {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(job_id) {
                Some(job) => {
                    f(job);
                    true
                }
                None => false,
            }
        };
        if found {
            self.save();
        }
        found
    }

    /// Transition a job's status, enforcing forward-only movement. A
    /// terminal job never changes; returns whether the transition took.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> bool {
        let mut changed = false;
        self.update(job_id, |job| {
            if job.status.is_terminal() {
                debug!(
                    "ignoring transition {} -> {} for terminal job {}",
                    job.status, status, job_id
                );
                return;
            }
            job.status = status;
            changed = true;
        });
        changed
    }

    /// Append a progress event to the job's (transient) event log.
    pub fn append_progress(&self, job_id: &str, event: serde_json::Value) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(job_id) {
            job.progress.push(event);
        }
    }

    /// Progress events at or after `from_index`.
    pub fn progress_since(&self, job_id: &str, from_index: usize) -> Vec<serde_json::Value> {
        let jobs = self.jobs.lock().unwrap();
        match jobs.get(job_id) {
            Some(job) if from_index < job.progress.len() => {
                job.progress[from_index..].to_vec()
            }
            _ => vec![],
        }
    }

    pub fn delete(&self, job_id: &str) -> Option<Job> {
        self.abort_task(job_id);
        let removed = self.jobs.lock().unwrap().remove(job_id);
        if removed.is_some() {
            self.save();
        }
        removed
    }

    /// Job list for the UI, newest first.
    pub fn list(&self) -> Vec<serde_json::Value> {
        let jobs = self.jobs.lock().unwrap();
        let mut list: Vec<(String, serde_json::Value)> = jobs
            .iter()
            .map(|(id, job)| {
                (
                    job.created_at.clone(),
                    serde_json::json!({
                        "job_id": id,
                        "filename": job.filename,
                        "created_at": job.created_at,
                        "status": job.status,
                        "total": job.total,
                        "summary": job.summary,
                        "last_progress": job.progress.last(),
                    }),
                )
            })
            .collect();
        list.sort_by(|a, b| b.0.cmp(&a.0));
        list.into_iter().map(|(_, value)| value).collect()
    }

    // ── Task handles ──

    pub fn register_task(&self, job_id: &str, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap()
            .insert(job_id.to_owned(), handle);
    }

    /// Abort a job's task if it is still in flight. Returns whether a
    /// live task was aborted.
    pub fn abort_task(&self, job_id: &str) -> bool {
        match self.tasks.lock().unwrap().remove(job_id) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Drop the handle of a task that settled on its own.
    pub fn remove_task(&self, job_id: &str) {
        self.tasks.lock().unwrap().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> JobStore {
        JobStore::load(dir.path().join("jobs.json"))
    }

    #[test]
    fn terminal_statuses_never_move() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert("j1", Job::new("up.csv".into(), 3, "up.csv".into()));

        assert!(store.set_status("j1", JobStatus::Running));
        assert!(store.set_status("j1", JobStatus::Cancelled));
        // Cancelled is terminal: nothing moves it.
        assert!(!store.set_status("j1", JobStatus::Running));
        assert!(!store.set_status("j1", JobStatus::Complete));
        assert_eq!(store.get("j1").unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn in_flight_jobs_become_interrupted_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_file = dir.path().join("jobs.json");
        {
            let store = JobStore::load(&jobs_file);
            store.insert("q", Job::new("a.csv".into(), 1, "a.csv".into()));
            store.insert("r", Job::new("b.csv".into(), 1, "b.csv".into()));
            store.set_status("r", JobStatus::Running);
            store.insert("done", {
                let mut job = Job::new("c.csv".into(), 1, "c.csv".into());
                job.status = JobStatus::Complete;
                job
            });
        }

        let reloaded = JobStore::load(&jobs_file);
        assert_eq!(reloaded.get("q").unwrap().status, JobStatus::Interrupted);
        assert_eq!(reloaded.get("r").unwrap().status, JobStatus::Interrupted);
        assert_eq!(
            reloaded.get("r").unwrap().error.as_deref(),
            Some(INTERRUPTED_MESSAGE)
        );
        assert_eq!(reloaded.get("done").unwrap().status, JobStatus::Complete);
    }

    #[test]
    fn progress_log_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_file = dir.path().join("jobs.json");
        {
            let store = JobStore::load(&jobs_file);
            store.insert("j", Job::new("a.csv".into(), 1, "a.csv".into()));
            store.append_progress("j", serde_json::json!({"completed": 1}));
            assert_eq!(store.progress_since("j", 0).len(), 1);
            store.save();
        }
        let reloaded = JobStore::load(&jobs_file);
        assert!(reloaded.progress_since("j", 0).is_empty());
    }

    #[test]
    fn progress_tail_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert("j", Job::new("a.csv".into(), 1, "a.csv".into()));
        for i in 0..3 {
            store.append_progress("j", serde_json::json!({ "i": i }));
        }
        assert_eq!(store.progress_since("j", 0).len(), 3);
        assert_eq!(store.progress_since("j", 2).len(), 1);
        assert!(store.progress_since("j", 3).is_empty());
    }

    #[test]
    fn job_ids_are_eight_chars() {
        let id = new_job_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn list_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut older = Job::new("a.csv".into(), 1, "a.csv".into());
        older.created_at = "2024-01-01T00:00:00".to_owned();
        let mut newer = Job::new("b.csv".into(), 1, "b.csv".into());
        newer.created_at = "2024-06-01T00:00:00".to_owned();
        store.insert("old", older);
        store.insert("new", newer);

        let list = store.list();
        assert_eq!(list[0]["job_id"], "new");
        assert_eq!(list[1]["job_id"], "old");
    }
}
