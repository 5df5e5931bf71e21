use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agent::{TaskHandle, TaskState};
use crate::config::HeartbeatConfig;
use crate::logbuf::{LogBuffer, LogCategory};

/// Supplies the current task set; the gateway owns the registry.
pub type TaskSnapshotFn = Arc<dyn Fn() -> Vec<Arc<TaskHandle>> + Send + Sync>;

/// Periodic health snapshot plus a one-shot warning for tasks that run
/// past the stuck threshold.
pub struct Heartbeat {
    config: HeartbeatConfig,
    tasks: TaskSnapshotFn,
    log: Arc<LogBuffer>,
    started: Instant,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig, tasks: TaskSnapshotFn, log: Arc<LogBuffer>) -> Self {
        Self { config, tasks, log, started: Instant::now() }
    }

    pub async fn run(self) {
        loop {
            tokio::time::sleep(Duration::from_secs(self.config.every_sec)).await;
            self.tick();
        }
    }

    pub fn tick(&self) {
        let tasks = (self.tasks)();
        let active: Vec<_> = tasks
            .iter()
            .filter(|t| matches!(t.state(), TaskState::Running | TaskState::AwaitingAuth))
            .collect();

        self.log.push(
            LogCategory::Heartbeat,
            format!(
                "uptime={}s tasks={} rss={}KB",
                self.started.elapsed().as_secs(),
                active.len(),
                resident_kb().unwrap_or(0)
            ),
        );

        let now = Utc::now();
        for task in active {
            let running_sec = (now - task.started_at).num_seconds();
            if running_sec < self.config.stuck_task_warn_sec as i64 {
                continue;
            }
            // Warn once per task.
            if task.stuck_warned.swap(true, Ordering::SeqCst) {
                continue;
            }
            self.log.push(
                LogCategory::Warn,
                format!(
                    "task {} running for {}s (threshold {}s): {}",
                    task.id, running_sec, self.config.stuck_task_warn_sec, task.text
                ),
            );
            if let Some(path) = task
                .session_path
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
            {
                mark_session_stuck(&path, running_sec);
            }
        }
    }
}

fn mark_session_stuck(path: &std::path::Path, running_sec: i64) {
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = writeln!(
            f,
            "> heartbeat: task running longer than {}s\n",
            running_sec
        );
    }
}

/// VmRSS from /proc on Linux; None elsewhere.
fn resident_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TaskHandle;

    fn heartbeat_with(
        tasks: Vec<Arc<TaskHandle>>,
        stuck_sec: u64,
    ) -> (Heartbeat, Arc<LogBuffer>) {
        let log = Arc::new(LogBuffer::new());
        let hb = Heartbeat::new(
            HeartbeatConfig { every_sec: 5, stuck_task_warn_sec: stuck_sec },
            Arc::new(move || tasks.clone()),
            log.clone(),
        );
        (hb, log)
    }

    #[test]
    fn test_tick_emits_snapshot() {
        let (hb, log) = heartbeat_with(Vec::new(), 30);
        hb.tick();
        let lines = log.snapshot(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].line.contains("tasks=0"));
    }

    #[test]
    fn test_fresh_task_is_not_stuck() {
        let handle = TaskHandle::new(Some(1), "long task", "gpt-4o-mini");
        *handle.state.lock().unwrap() = TaskState::Running;
        let (hb, log) = heartbeat_with(vec![handle.clone()], 30);
        hb.tick();
        let warns = log
            .snapshot(10)
            .into_iter()
            .filter(|l| l.category == LogCategory::Warn)
            .count();
        assert_eq!(warns, 0);
        assert!(!handle.stuck_warned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mark_session_stuck_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.md");
        std::fs::write(&path, "# Session\n").unwrap();
        mark_session_stuck(&path, 120);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("> heartbeat: task running longer than 120s"));
    }
}
