use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::paths::write_atomic;

/// One scheduled task in `workspace/cron/jobs.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(alias = "every_sec")]
    pub every_sec: u64,
    pub task: String,
    pub chat_id: Option<i64>,
    pub model_profile: Option<String>,
    #[serde(alias = "run_on_startup")]
    pub run_on_startup: bool,
    #[serde(alias = "last_run_at")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Default for CronJob {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: true,
            every_sec: 3600,
            task: String::new(),
            chat_id: None,
            model_profile: None,
            run_on_startup: false,
            last_run_at: None,
        }
    }
}

/// Callback the scheduler submits due jobs through; it is the same
/// admission path a `/run` command takes.
pub type SubmitFn = Arc<dyn Fn(CronJob) -> BoxFuture<'static, ()> + Send + Sync>;

/// Timer-driven task submission over a JSON job file. The file is
/// re-read every tick so edits land without a restart; `lastRunAt` is
/// written back after each submission.
pub struct CronScheduler {
    jobs_path: PathBuf,
    tick_sec: u64,
    submit: SubmitFn,
    started: Mutex<bool>,
}

impl CronScheduler {
    pub fn new(jobs_path: PathBuf, tick_sec: u64, submit: SubmitFn) -> Self {
        Self {
            jobs_path,
            tick_sec: tick_sec.max(2),
            submit,
            started: Mutex::new(false),
        }
    }

    fn load_jobs(&self) -> Vec<CronJob> {
        let raw = match std::fs::read_to_string(&self.jobs_path) {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<CronJob>>(&raw) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("cron: jobs.json malformed ({}), ignoring", e);
                Vec::new()
            }
        }
    }

    fn save_jobs(&self, jobs: &[CronJob]) {
        match serde_json::to_string_pretty(jobs) {
            Ok(raw) => {
                if let Err(e) = write_atomic(&self.jobs_path, raw.as_bytes()) {
                    warn!("cron: could not persist jobs.json: {}", e);
                }
            }
            Err(e) => warn!("cron: serialize failed: {}", e),
        }
    }

    /// `everySec` never undercuts the scheduler tick.
    fn effective_interval(&self, job: &CronJob) -> u64 {
        job.every_sec.max(self.tick_sec)
    }

    fn is_due(&self, job: &CronJob, now: DateTime<Utc>) -> bool {
        if !job.enabled || job.task.is_empty() {
            return false;
        }
        match job.last_run_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).num_seconds();
                elapsed >= self.effective_interval(job) as i64
            }
        }
    }

    async fn submit_job(&self, jobs: &mut [CronJob], index: usize) {
        let now = Utc::now();
        jobs[index].last_run_at = Some(now);
        let job = jobs[index].clone();
        (self.submit)(job).await;
    }

    /// One pass over the job file; used by the tick loop and by
    /// `/cronrun` (which forces a single job regardless of schedule).
    pub async fn tick(&self) {
        let mut jobs = self.load_jobs();
        let now = Utc::now();
        let mut dirty = false;
        for i in 0..jobs.len() {
            if self.is_due(&jobs[i], now) {
                self.submit_job(&mut jobs, i).await;
                dirty = true;
            }
        }
        if dirty {
            self.save_jobs(&jobs);
        }
    }

    /// Force one job to run now. Returns false for unknown or disabled ids.
    pub async fn run_job_now(&self, id: &str) -> bool {
        let mut jobs = self.load_jobs();
        let Some(index) = jobs.iter().position(|j| j.id == id) else {
            return false;
        };
        if !jobs[index].enabled {
            return false;
        }
        self.submit_job(&mut jobs, index).await;
        self.save_jobs(&jobs);
        true
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.load_jobs()
    }

    /// Run forever: startup jobs once, then the fixed tick.
    pub async fn run(self: Arc<Self>) {
        {
            let mut started = self.started.lock().await;
            if *started {
                return;
            }
            *started = true;
        }

        // runOnStartup jobs are submitted once, schedule notwithstanding.
        let mut jobs = self.load_jobs();
        let mut dirty = false;
        for i in 0..jobs.len() {
            if jobs[i].enabled && jobs[i].run_on_startup && !jobs[i].task.is_empty() {
                self.submit_job(&mut jobs, i).await;
                dirty = true;
            }
        }
        if dirty {
            self.save_jobs(&jobs);
        }

        loop {
            tokio::time::sleep(Duration::from_secs(self.tick_sec)).await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(
        dir: &tempfile::TempDir,
        tick_sec: u64,
    ) -> (Arc<CronScheduler>, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let count2 = count.clone();
        let names2 = names.clone();
        let submit: SubmitFn = Arc::new(move |job: CronJob| {
            let count = count2.clone();
            let names = names2.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                names.lock().unwrap().push(job.id);
            })
        });
        let sched = Arc::new(CronScheduler::new(
            dir.path().join("jobs.json"),
            tick_sec,
            submit,
        ));
        (sched, count, names)
    }

    fn write_jobs(dir: &tempfile::TempDir, jobs: serde_json::Value) {
        std::fs::write(
            dir.path().join("jobs.json"),
            serde_json::to_string_pretty(&jobs).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_due_job_submitted_and_last_run_persisted() {
        let dir = tempfile::tempdir().unwrap();
        write_jobs(
            &dir,
            serde_json::json!([
                {"id": "j1", "name": "morning", "enabled": true, "everySec": 60, "task": "check email"}
            ]),
        );
        let (sched, count, _) = scheduler(&dir, 2);

        sched.tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Immediately due again? No: lastRunAt was persisted.
        sched.tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let raw = std::fs::read_to_string(dir.path().join("jobs.json")).unwrap();
        assert!(raw.contains("lastRunAt"));
    }

    #[tokio::test]
    async fn test_disabled_and_empty_jobs_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_jobs(
            &dir,
            serde_json::json!([
                {"id": "off", "enabled": false, "everySec": 1, "task": "x"},
                {"id": "empty", "enabled": true, "everySec": 1, "task": ""}
            ]),
        );
        let (sched, count, _) = scheduler(&dir, 2);
        sched.tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_sec_clamped_to_tick() {
        let dir = tempfile::tempdir().unwrap();
        write_jobs(
            &dir,
            serde_json::json!([
                {"id": "fast", "enabled": true, "everySec": 0, "task": "spin",
                 "lastRunAt": Utc::now().to_rfc3339()}
            ]),
        );
        let (sched, count, _) = scheduler(&dir, 30);
        // lastRunAt is fresh and the effective interval is the 30s tick,
        // so nothing is due.
        sched.tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_job_now() {
        let dir = tempfile::tempdir().unwrap();
        write_jobs(
            &dir,
            serde_json::json!([
                {"id": "j1", "enabled": true, "everySec": 3600, "task": "water plants",
                 "lastRunAt": Utc::now().to_rfc3339()}
            ]),
        );
        let (sched, count, names) = scheduler(&dir, 2);
        assert!(sched.run_job_now("j1").await);
        assert!(!sched.run_job_now("missing").await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(names.lock().unwrap().as_slice(), &["j1".to_string()]);
    }

    #[test]
    fn test_snake_case_jobs_accepted() {
        let raw = r#"[{"id":"a","enabled":true,"every_sec":120,"task":"t","run_on_startup":true}]"#;
        let jobs: Vec<CronJob> = serde_json::from_str(raw).unwrap();
        assert_eq!(jobs[0].every_sec, 120);
        assert!(jobs[0].run_on_startup);
    }
}
