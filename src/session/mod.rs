use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::action::Action;
use crate::errors::ErrorKind;

/// Writes the per-task markdown session file. One writer per task; the
/// file is append-only and every entry lands in a single write call.
#[derive(Debug, Clone)]
pub struct SessionWriter {
    pub session_id: String,
    pub path: PathBuf,
    screenshots_root: PathBuf,
    max_screenshots: usize,
}

impl SessionWriter {
    /// Create `workspace/sessions/<YYYYMMDD-HHMMSS-id>.md` with the task
    /// header.
    pub fn create(
        sessions_dir: &Path,
        screenshots_root: &Path,
        max_screenshots: usize,
        task_text: &str,
        model_name: &str,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let session_id = format!(
            "{}-{}",
            now.format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().to_string()[..6]
        );
        let path = sessions_dir.join(format!("{}.md", session_id));
        std::fs::create_dir_all(sessions_dir)?;

        let header = format!(
            "# Session {}\n\nTask: {}\nModel: {}\nStarted: {}\n\n",
            session_id,
            task_text,
            model_name,
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );
        std::fs::write(&path, header)?;

        Ok(Self {
            session_id,
            path,
            screenshots_root: screenshots_root.to_path_buf(),
            max_screenshots: max_screenshots.max(1),
        })
    }

    fn append(&self, entry: &str) -> anyhow::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(entry.as_bytes())?;
        Ok(())
    }

    /// Append one step entry: thought, canonical action JSON, result
    /// message, and the screenshot link when one was saved.
    pub fn append_step(
        &self,
        index: u32,
        thought: &str,
        action: &Action,
        result_message: &str,
        screenshot_path: Option<&Path>,
    ) -> anyhow::Result<()> {
        let mut entry = format!(
            "## Step {}\n\n{}\n\n```json\n{}\n```\n\n{}\n",
            index,
            if thought.is_empty() { "(no thought)" } else { thought },
            action.to_json(),
            result_message
        );
        if let Some(p) = screenshot_path {
            entry.push_str(&format!("\n![step {}]({})\n", index, p.display()));
        }
        entry.push('\n');
        self.append(&entry)
    }

    /// Freeform marker line, e.g. the heartbeat's stuck-task note.
    pub fn append_note(&self, note: &str) -> anyhow::Result<()> {
        self.append(&format!("> {}\n\n", note))
    }

    /// Terminal entry; written exactly once per task.
    pub fn append_terminal(&self, outcome: &str, message: &str) -> anyhow::Result<()> {
        self.append(&format!(
            "## Outcome\n\n{}: {}\n\nEnded: {}\n",
            outcome,
            message,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ))
    }

    pub fn append_error(&self, kind: ErrorKind, message: &str) -> anyhow::Result<()> {
        self.append_terminal(kind.as_str(), message)
    }

    /// Save a step screenshot under
    /// `state/screenshots/<sessionId>/step-<N>.png`, then evict the
    /// oldest files if the retention cap is exceeded.
    pub fn save_screenshot(&self, step: u32, png: &[u8]) -> anyhow::Result<PathBuf> {
        let dir = self.screenshots_root.join(&self.session_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("step-{}.png", step));
        std::fs::write(&path, png)?;
        evict_screenshots(&self.screenshots_root, self.max_screenshots);
        Ok(path)
    }
}

/// Keep at most `max_count` PNGs under the screenshots root, oldest
/// (by modification time) evicted first.
fn evict_screenshots(root: &Path, max_count: usize) {
    let pattern = format!("{}/**/step-*.png", root.display());
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = glob::glob(&pattern)
        .map(|paths| {
            paths
                .flatten()
                .filter_map(|p| {
                    let mtime = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                    Some((mtime, p))
                })
                .collect()
        })
        .unwrap_or_default();

    if files.len() <= max_count {
        return;
    }
    files.sort_by_key(|(mtime, _)| *mtime);
    let excess = files.len() - max_count;
    for (_, path) in files.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("screenshot eviction failed for {}: {}", path.display(), e);
        } else {
            debug!("evicted screenshot {}", path.display());
        }
    }
}

/// Appends one-paragraph task summaries to the per-day memory file.
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    memory_dir: PathBuf,
}

impl MemoryWriter {
    pub fn new(memory_dir: &Path) -> Self {
        Self { memory_dir: memory_dir.to_path_buf() }
    }

    /// `workspace/memory/<YYYY-MM-DD>.md` (UTC date).
    pub fn today_path(&self) -> PathBuf {
        self.memory_dir
            .join(format!("{}.md", Utc::now().format("%Y-%m-%d")))
    }

    /// Append a terminal-task summary with outcome and session path.
    pub fn append_task_summary(
        &self,
        task_text: &str,
        outcome: &str,
        message: &str,
        session_path: &Path,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.memory_dir)?;
        let path = self.today_path();
        let entry = format!(
            "- [{}] {} — task: \"{}\" — {} (session: {})\n",
            Utc::now().format("%H:%M:%S UTC"),
            outcome,
            task_text,
            message,
            session_path.display()
        );
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        f.write_all(entry.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(tmp: &tempfile::TempDir, max: usize) -> SessionWriter {
        SessionWriter::create(
            &tmp.path().join("sessions"),
            &tmp.path().join("screenshots"),
            max,
            "open the settings app",
            "gpt-4o-mini",
        )
        .unwrap()
    }

    #[test]
    fn test_session_header() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(&tmp, 50);
        let content = std::fs::read_to_string(&w.path).unwrap();
        assert!(content.contains("Task: open the settings app"));
        assert!(content.contains("Model: gpt-4o-mini"));
        assert!(content.contains("Started: "));
    }

    #[test]
    fn test_step_entries_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(&tmp, 50);
        for i in 1..=3u32 {
            w.append_step(
                i,
                "looking at the screen",
                &Action::Tap { x: 10, y: 20 },
                "Tapped (10, 20)",
                None,
            )
            .unwrap();
        }
        w.append_terminal("succeeded", "Task finished.").unwrap();
        let content = std::fs::read_to_string(&w.path).unwrap();
        let idx1 = content.find("## Step 1").unwrap();
        let idx2 = content.find("## Step 2").unwrap();
        let idx3 = content.find("## Step 3").unwrap();
        assert!(idx1 < idx2 && idx2 < idx3);
        assert!(content.contains("succeeded: Task finished."));
    }

    #[test]
    fn test_screenshot_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(&tmp, 3);
        for i in 1..=5u32 {
            w.save_screenshot(i, b"\x89PNG\r\n\x1a\nfake").unwrap();
            // mtime granularity on some filesystems is coarse.
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let pattern = format!("{}/**/step-*.png", tmp.path().join("screenshots").display());
        let remaining: Vec<_> = glob::glob(&pattern).unwrap().flatten().collect();
        assert_eq!(remaining.len(), 3);
        // The newest three survive.
        let names: Vec<String> = remaining
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"step-5.png".to_string()));
        assert!(!names.contains(&"step-1.png".to_string()));
    }

    #[test]
    fn test_memory_append() {
        let tmp = tempfile::tempdir().unwrap();
        let mem = MemoryWriter::new(&tmp.path().join("memory"));
        mem.append_task_summary(
            "check the weather",
            "succeeded",
            "Weather shown.",
            Path::new("/tmp/s.md"),
        )
        .unwrap();
        mem.append_task_summary(
            "send a text",
            "failed",
            "max_steps_reached",
            Path::new("/tmp/s2.md"),
        )
        .unwrap();
        let content = std::fs::read_to_string(mem.today_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("succeeded"));
        assert!(content.contains("max_steps_reached"));
    }
}
