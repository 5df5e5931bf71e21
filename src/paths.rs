use std::path::{Path, PathBuf};

/// Resolves the home/state/workspace roots for a run.
///
/// Precedence for the home root:
///   1. `OPENPOCKET_HOME` environment variable
///   2. `~/.openpocket`
///
/// Everything the runtime persists lives under this root:
///   config.json, state/, workspace/.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
}

impl Paths {
    pub fn resolve() -> Self {
        let home = std::env::var("OPENPOCKET_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let user_home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(user_home).join(".openpocket")
            });
        Self { home }
    }

    pub fn from_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Canonical config path, honoring `OPENPOCKET_CONFIG_PATH` (alias
    /// `OPENPOCKET_CONFIG`).
    pub fn config_file(&self) -> PathBuf {
        for var in ["OPENPOCKET_CONFIG_PATH", "OPENPOCKET_CONFIG"] {
            if let Ok(v) = std::env::var(var) {
                if !v.is_empty() {
                    return PathBuf::from(v);
                }
            }
        }
        self.home.join("config.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.home.join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_dir().join("sessions")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.workspace_dir().join("memory")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.state_dir().join("screenshots")
    }

    pub fn script_runs_dir(&self) -> PathBuf {
        self.workspace_dir().join("scripts").join("runs")
    }

    pub fn cron_jobs_file(&self) -> PathBuf {
        self.workspace_dir().join("cron").join("jobs.json")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.workspace_dir().join("skills")
    }

    pub fn relay_state_file(&self) -> PathBuf {
        self.state_dir().join("human-auth-relay").join("requests.json")
    }

    pub fn auth_artifacts_dir(&self) -> PathBuf {
        self.state_dir().join("human-auth-artifacts")
    }

    pub fn onboarding_file(&self) -> PathBuf {
        self.state_dir().join("onboarding.json")
    }

    /// Create the directory skeleton a run expects. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.home.clone(),
            self.state_dir(),
            self.workspace_dir(),
            self.sessions_dir(),
            self.memory_dir(),
            self.screenshots_dir(),
            self.script_runs_dir(),
            self.skills_dir(),
            self.auth_artifacts_dir(),
            self.state_dir().join("human-auth-relay"),
            self.workspace_dir().join("cron"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Expand a leading `~` and absolutize relative paths against the
/// current directory. Config path fields are always stored absolute.
pub fn absolutize(raw: &str) -> PathBuf {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(rest)
    } else if raw == "~" {
        PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
    } else {
        PathBuf::from(raw)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

/// Atomic write: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!(
        "tmp-{}",
        &uuid::Uuid::new_v4().to_string()[..8]
    ));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolutize_tilde() {
        let p = absolutize("~/foo/bar");
        assert!(p.is_absolute());
        assert!(p.ends_with("foo/bar"));
    }

    #[test]
    fn test_absolutize_absolute_passthrough() {
        assert_eq!(absolutize("/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_layout_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_home(dir.path().join("op"));
        paths.ensure_layout().unwrap();
        paths.ensure_layout().unwrap();
        assert!(paths.sessions_dir().is_dir());
        assert!(paths.screenshots_dir().is_dir());
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("state.json");
        write_atomic(&target, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"a\":1}");
        write_atomic(&target, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"a\":2}");
    }
}
