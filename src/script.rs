use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ScriptExecutorConfig;

/// Scripts beyond this size are rejected before validation even looks at
/// the contents.
const MAX_SCRIPT_CHARS: usize = 12_000;

/// Substrings that block a script outright, checked per line after
/// comment stripping.
const DENY_PATTERNS: &[&str] = &[
    "sudo", "shutdown", "reboot", "poweroff", "halt", "mkfs", "dd if=", "rm -rf /",
];

/// Outcome of one sandboxed run. Non-zero exits and timeouts are data,
/// not errors; `execute` only fails on I/O problems creating artifacts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptResult {
    pub ok: bool,
    pub run_id: String,
    pub run_dir: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    config: ScriptExecutorConfig,
    runs_dir: PathBuf,
}

impl ScriptExecutor {
    pub fn new(config: ScriptExecutorConfig, runs_dir: PathBuf) -> Self {
        Self { config, runs_dir }
    }

    /// Validate then run a shell script in its own run directory.
    /// Validation failures return `ok=false` with no artifacts written.
    pub async fn execute(&self, script: &str, timeout_sec: Option<u64>) -> anyhow::Result<ScriptResult> {
        let timeout_sec = timeout_sec.unwrap_or(self.config.timeout_sec).max(1);

        if let Err(reason) = validate_script(script, &self.config.allowed_commands) {
            warn!("script blocked: {}", reason);
            return Ok(ScriptResult {
                ok: false,
                run_id: String::new(),
                run_dir: String::new(),
                exit_code: None,
                timed_out: false,
                duration_ms: 0,
                stdout: String::new(),
                stderr: reason,
            });
        }

        let run_id = format!("run-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let run_dir = self.runs_dir.join(&run_id);
        std::fs::create_dir_all(&run_dir)?;

        let script_path = run_dir.join("script.sh");
        std::fs::write(&script_path, script)?;
        let stdout_path = run_dir.join("stdout.log");
        let stderr_path = run_dir.join("stderr.log");

        // Stream output straight into the artifact files so a killed run
        // still leaves whatever it printed.
        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let started = Instant::now();
        let mut child = Command::new("sh")
            .arg(&script_path)
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()?;

        let (exit_code, timed_out) =
            match tokio::time::timeout(Duration::from_secs(timeout_sec), child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    // SIGKILL; the child gets no chance to trap it.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (None, true)
                }
            };
        let duration_ms = started.elapsed().as_millis() as u64;

        let stdout = read_truncated(&stdout_path, self.config.max_output_chars);
        let stderr = read_truncated(&stderr_path, self.config.max_output_chars);
        let ok = !timed_out && exit_code == Some(0);

        let result = ScriptResult {
            ok,
            run_id: run_id.clone(),
            run_dir: run_dir.to_string_lossy().into_owned(),
            exit_code,
            timed_out,
            duration_ms,
            stdout,
            stderr,
        };
        std::fs::write(
            run_dir.join("result.json"),
            serde_json::to_string_pretty(&result)?,
        )?;
        info!(
            "script {} finished: ok={} exit={:?} timed_out={} ({}ms)",
            run_id, ok, exit_code, timed_out, duration_ms
        );
        Ok(result)
    }
}

/// All rules must pass before a single process is spawned.
fn validate_script(script: &str, allowed: &[String]) -> Result<(), String> {
    if script.trim().is_empty() {
        return Err("Script is empty".into());
    }
    if script.chars().count() > MAX_SCRIPT_CHARS {
        return Err(format!(
            "Script exceeds {} characters ({})",
            MAX_SCRIPT_CHARS,
            script.chars().count()
        ));
    }

    for raw_line in script.lines() {
        let line = strip_comment(raw_line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        for pattern in DENY_PATTERNS {
            if trimmed.contains(pattern) {
                return Err(format!("Script contains blocked pattern '{}'", pattern));
            }
        }

        for segment in split_segments(trimmed) {
            if let Some(cmd) = command_name(&segment) {
                let base = cmd.rsplit('/').next().unwrap_or(&cmd);
                if !allowed.iter().any(|a| a == base || a == &cmd) {
                    return Err(format!(
                        "Command '{}' is not allowed; permitted commands: {}",
                        base,
                        allowed.join(", ")
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Drop everything from an unquoted `#` to end of line.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_single = false;
    let mut in_double = false;
    for c in line.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => break,
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Split a line on the shell separators `&&`, `||`, `|`, and `;`.
fn split_segments(line: &str) -> Vec<String> {
    line.replace("&&", "\x00")
        .replace("||", "\x00")
        .replace('|', "\x00")
        .replace(';', "\x00")
        .split('\x00')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// First token of a segment that is not a `NAME=value` assignment or a
/// redirection.
fn command_name(segment: &str) -> Option<String> {
    for token in segment.split_whitespace() {
        if is_assignment(token) {
            continue;
        }
        if token.starts_with('>') || token.starts_with('<') {
            return None;
        }
        return Some(token.to_string());
    }
    None
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn read_truncated(path: &Path, max_chars: usize) -> String {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    if content.chars().count() <= max_chars {
        return content;
    }
    let truncated: String = content.chars().take(max_chars).collect();
    format!("{}\n… (truncated)", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(cmds: &[&str]) -> Vec<String> {
        cmds.iter().map(|s| s.to_string()).collect()
    }

    fn executor(allowed: &[&str]) -> (tempfile::TempDir, ScriptExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptExecutor::new(
            ScriptExecutorConfig {
                allowed_commands: allow(allowed),
                timeout_sec: 5,
                max_output_chars: 1000,
            },
            dir.path().join("runs"),
        );
        (dir, exec)
    }

    #[test]
    fn test_validate_empty_script() {
        assert!(validate_script("", &allow(&["echo"])).is_err());
        assert!(validate_script("   \n ", &allow(&["echo"])).is_err());
    }

    #[test]
    fn test_validate_deny_patterns() {
        let allowed = allow(&["echo", "rm", "dd"]);
        assert!(validate_script("sudo echo hi", &allowed).is_err());
        assert!(validate_script("echo ok\nrm -rf / --no-preserve-root", &allowed).is_err());
        assert!(validate_script("dd if=/dev/zero of=/dev/sda", &allowed).is_err());
        // Denied text inside a comment is fine.
        assert!(validate_script("echo hi # sudo would be bad", &allowed).is_ok());
    }

    #[test]
    fn test_validate_allowlist() {
        let allowed = allow(&["echo", "date"]);
        assert!(validate_script("echo hi && date", &allowed).is_ok());
        let err = validate_script("echo hi; rm /tmp/foo", &allowed).unwrap_err();
        assert!(err.contains("Command 'rm' is not allowed"));
        // Pipes count as segment boundaries too.
        assert!(validate_script("echo hi | grep h", &allowed).is_err());
    }

    #[test]
    fn test_validate_skips_assignments() {
        let allowed = allow(&["echo"]);
        assert!(validate_script("FOO=bar echo $FOO", &allowed).is_ok());
        assert!(validate_script("FOO=bar BAZ=1 echo x", &allowed).is_ok());
    }

    #[test]
    fn test_validate_path_prefixed_command() {
        let allowed = allow(&["echo"]);
        assert!(validate_script("/bin/echo hi", &allowed).is_ok());
        assert!(validate_script("/bin/cat /etc/passwd", &allowed).is_err());
    }

    #[tokio::test]
    async fn test_execute_blocked_writes_nothing() {
        let (_dir, exec) = executor(&["echo"]);
        let result = exec.execute("rm -rf /tmp/foo", None).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("not allowed") || result.stderr.contains("blocked"));
        assert!(result.run_dir.is_empty());
    }

    #[tokio::test]
    async fn test_execute_success_writes_artifacts() {
        let (_dir, exec) = executor(&["echo"]);
        let result = exec.execute("echo hello", None).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");

        let run_dir = PathBuf::from(&result.run_dir);
        assert!(run_dir.join("script.sh").exists());
        assert!(run_dir.join("stdout.log").exists());
        assert!(run_dir.join("stderr.log").exists());
        assert!(run_dir.join("result.json").exists());
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_is_not_an_error() {
        let (_dir, exec) = executor(&["sh", "false", "echo"]);
        let result = exec.execute("false", None).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_child() {
        let (_dir, exec) = executor(&["sleep", "echo"]);
        let result = exec.execute("echo early\nsleep 30", Some(1)).await.unwrap();
        assert!(!result.ok);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.duration_ms >= 1000);
        // Output printed before the kill survived in the artifacts.
        assert_eq!(result.stdout.trim(), "early");
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let (_dir, exec) = executor(&["seq"]);
        let result = exec.execute("seq 1 10000", None).await.unwrap();
        assert!(result.stdout.len() <= 1000 + 20);
        assert!(result.stdout.contains("truncated"));
    }
}
