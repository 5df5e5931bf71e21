use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::action::Action;
use crate::adb::AdbClient;
use crate::bridge::{AuthRequest, DecisionStatus, HumanAuthBridge, OpenedAuth};
use crate::config::Config;
use crate::errors::ErrorKind;
use crate::model::{ModelClient, PlanRequest};
use crate::script::ScriptExecutor;
use crate::session::{MemoryWriter, SessionWriter};
use crate::skills::SkillLoader;

/// Consecutive adb failures tolerated before the task dies.
const MAX_ADB_FAILURES: u32 = 3;

/// Anti-loop ring length and the window checked against it.
const FINGERPRINT_RING: usize = 8;
const FINGERPRINT_WINDOW: usize = 4;
const FINGERPRINT_TRIGGER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    AwaitingAuth,
    Succeeded,
    Failed,
    Cancelled,
}

/// Shared view of a running task: the gateway, heartbeat, and dashboard
/// read it; only the owning agent loop writes it.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: String,
    pub chat_id: Option<i64>,
    pub text: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub state: Mutex<TaskState>,
    pub step_count: AtomicU32,
    pub cancelled: AtomicBool,
    pub session_path: Mutex<Option<PathBuf>>,
    /// Set once by the heartbeat when the task runs long.
    pub stuck_warned: AtomicBool,
}

impl TaskHandle {
    pub fn new(chat_id: Option<i64>, text: &str, model: &str) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            chat_id,
            text: text.to_string(),
            model: model.to_string(),
            started_at: Utc::now(),
            state: Mutex::new(TaskState::Queued),
            step_count: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            session_path: Mutex::new(None),
            stuck_warned: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Events surfaced to the gateway while a task runs.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AuthOpened(OpenedAuth),
    Progress { step: u32, message: String },
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub error: Option<ErrorKind>,
    pub message: String,
    pub steps: u32,
    pub session_path: Option<PathBuf>,
}

/// Everything an agent loop borrows from the runtime.
pub struct AgentDeps {
    pub config: Arc<Config>,
    pub adb: AdbClient,
    pub bridge: Arc<HumanAuthBridge>,
    pub script: ScriptExecutor,
    pub skills: SkillLoader,
}

// ── Anti-loop ring ──────────────────────────────────────────────────────────

/// Bounded ring of `(actionType, coarseTarget)` fingerprints, owned by
/// one task and reset on task boundaries.
#[derive(Debug, Default)]
pub struct FingerprintRing {
    entries: Vec<String>,
}

impl FingerprintRing {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(action: &Action) -> String {
        format!("{}|{}", action.action_type(), action.coarse_target())
    }

    /// True when the incoming action matches at least 3 of the last 4
    /// recorded fingerprints.
    pub fn is_looping(&self, action: &Action) -> bool {
        let fp = Self::fingerprint(action);
        let window_start = self.entries.len().saturating_sub(FINGERPRINT_WINDOW);
        let matches = self.entries[window_start..]
            .iter()
            .filter(|e| **e == fp)
            .count();
        matches >= FINGERPRINT_TRIGGER
    }

    pub fn record(&mut self, action: &Action) {
        self.entries.push(Self::fingerprint(action));
        if self.entries.len() > FINGERPRINT_RING {
            self.entries.remove(0);
        }
    }
}

/// Directive appended to the system prompt after a loop is detected.
const STRATEGY_HINT: &str = "NOTE: your recent actions repeat without progress. \
Switch strategy: scroll, go back, use a different UI element, or reconsider the approach.";

// ── The loop ────────────────────────────────────────────────────────────────

pub struct AgentLoop {
    deps: AgentDeps,
    handle: Arc<TaskHandle>,
    notify: Arc<dyn Fn(AgentEvent) + Send + Sync>,
}

impl AgentLoop {
    pub fn new(
        deps: AgentDeps,
        handle: Arc<TaskHandle>,
        notify: Arc<dyn Fn(AgentEvent) + Send + Sync>,
    ) -> Self {
        Self { deps, handle, notify }
    }

    /// Run the task to a terminal state. Every exit path writes the
    /// terminal session and memory entries exactly once.
    pub async fn run(self) -> TaskOutcome {
        let config = self.deps.config.clone();
        let (profile_name, profile, profile_warning) =
            config.resolve_profile(Some(&self.handle.model));

        // Admission: the profile must yield a secret before anything runs.
        let Some(api_key) = profile.resolve_secret() else {
            let message = format!(
                "No API key for model '{}': set apiKey or {} in config.json",
                profile_name,
                if profile.api_key_env.is_empty() { "apiKeyEnv" } else { &profile.api_key_env }
            );
            return self.admission_failure(ErrorKind::SecretMissing, &message);
        };

        let session = match SessionWriter::create(
            &PathBuf::from(&config.paths.workspace).join("sessions"),
            &PathBuf::from(&config.paths.state).join("screenshots"),
            config.screenshots.max_count,
            &self.handle.text,
            &profile_name,
        ) {
            Ok(s) => s,
            Err(e) => {
                return TaskOutcome {
                    state: TaskState::Failed,
                    error: Some(ErrorKind::Internal),
                    message: format!("could not create session file: {}", e),
                    steps: 0,
                    session_path: None,
                }
            }
        };
        *self.handle.session_path.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(session.path.clone());
        let memory = MemoryWriter::new(&PathBuf::from(&config.paths.workspace).join("memory"));

        if let Some(warning) = profile_warning {
            let _ = session.append_note(&warning);
        }

        let workspace_prompts = load_workspace_prompts(&config.paths.workspace);
        let model = ModelClient::new(
            profile.clone(),
            api_key,
            &self.deps.skills.catalog_text(),
            &workspace_prompts,
        );

        self.handle.set_state(TaskState::Running);
        info!("task {} running: {}", self.handle.id, self.handle.text);

        let device = match self.deps.adb.select_device(None).await {
            Ok(d) => d,
            Err(e) => {
                return self.finish(
                    &session,
                    &memory,
                    TaskState::Failed,
                    Some(ErrorKind::DeviceUnavailable),
                    &e.to_string(),
                );
            }
        };

        let mut ring = FingerprintRing::new();
        let mut history: Vec<String> = Vec::new();
        let mut strategy_hint: Option<&str> = None;
        let mut adb_failures: u32 = 0;
        let mut escalate_permission = false;

        let max_steps = config.agent.max_steps;
        for step in 1..=max_steps {
            // ── Observe ─────────────────────────────────────────────
            let snapshot = match self
                .deps
                .adb
                .capture_screen_snapshot(&device, profile.is_claude_like())
                .await
            {
                Ok(s) => {
                    adb_failures = 0;
                    s
                }
                Err(e) => {
                    adb_failures += 1;
                    if adb_failures >= MAX_ADB_FAILURES {
                        return self.finish(
                            &session,
                            &memory,
                            TaskState::Failed,
                            Some(ErrorKind::AdbFailed),
                            &format!("observation failed {} times: {}", adb_failures, e),
                        );
                    }
                    let action = Action::Wait { duration_ms: 1000, reason: e.to_string() };
                    let _ = session.append_step(step, "", &action, &e.to_string(), None);
                    self.handle.step_count.store(step, Ordering::SeqCst);
                    history.push(format!("{}. observe failed: {}", step, e));
                    if self.check_cancelled(step, &session, &memory).is_some() {
                        return self.cancelled_outcome(&session, step);
                    }
                    tokio::time::sleep(Duration::from_millis(config.agent.loop_delay_ms)).await;
                    continue;
                }
            };

            // ── Plan ────────────────────────────────────────────────
            let request = PlanRequest {
                task: &self.handle.text,
                step,
                max_steps,
                snapshot: &snapshot,
                history: &history,
                strategy_hint,
            };
            strategy_hint = None;
            let planned = match model.plan(&request).await {
                Ok(p) => p,
                Err(e) => {
                    return self.finish(
                        &session,
                        &memory,
                        TaskState::Failed,
                        Some(ErrorKind::ModelFailed),
                        &e.to_string(),
                    );
                }
            };

            // Auth auto-escalation: a permission dialog in the foreground
            // keeps the model busy tapping in circles; force an approval
            // round instead.
            let mut action = planned.action;
            if escalate_permission
                && !matches!(action, Action::RequestHumanAuth { .. })
                && config
                    .agent
                    .permission_controller_packages
                    .iter()
                    .any(|p| snapshot.current_app == *p)
            {
                action = Action::RequestHumanAuth {
                    capability: "permission".into(),
                    instruction: format!(
                        "A system permission dialog ({}) needs a decision.",
                        snapshot.current_app
                    ),
                    timeout_sec: config.human_auth.request_timeout_sec,
                };
            }
            escalate_permission = config
                .agent
                .permission_controller_packages
                .iter()
                .any(|p| snapshot.current_app == *p);

            // Anti-loop: tag the step and nudge the next plan.
            let anti_loop = ring.is_looping(&action);
            if anti_loop {
                strategy_hint = Some(STRATEGY_HINT);
            }
            ring.record(&action);

            // ── Rescale ─────────────────────────────────────────────
            let action = action.rescaled(
                snapshot.scale_x,
                snapshot.scale_y,
                snapshot.width_device as i64,
                snapshot.height_device as i64,
            );

            // ── Act ─────────────────────────────────────────────────
            let (executed, result_message, terminal) =
                self.act(&device, &session, step, action, &snapshot.current_app, &mut adb_failures)
                    .await;

            // ── Persist ─────────────────────────────────────────────
            let screenshot_path = session.save_screenshot(step, &snapshot.png).ok();
            let mut thought = planned.thought.clone();
            if anti_loop {
                thought = format!("{} [anti_loop=1]", thought.trim()).trim().to_string();
            }
            let _ = session.append_step(
                step,
                &thought,
                &executed,
                &result_message,
                screenshot_path.as_deref(),
            );
            self.handle.step_count.store(step, Ordering::SeqCst);
            history.push(format!(
                "{}. {} -> {}",
                step,
                executed.action_type(),
                first_line(&result_message)
            ));

            if let Some((state, kind, message)) = terminal {
                return self.finish(&session, &memory, state, kind, &message);
            }

            if step % config.agent.progress_report_interval == 0 {
                (self.notify)(AgentEvent::Progress {
                    step,
                    message: format!(
                        "Step {}/{}: {}",
                        step,
                        max_steps,
                        first_line(&result_message)
                    ),
                });
            }

            // Cancellation is checked after every persistence step.
            if self.check_cancelled(step, &session, &memory).is_some() {
                return self.cancelled_outcome(&session, step);
            }

            tokio::time::sleep(Duration::from_millis(config.agent.loop_delay_ms)).await;
        }

        self.finish(
            &session,
            &memory,
            TaskState::Failed,
            Some(ErrorKind::MaxStepsReached),
            &format!("gave up after {} steps", max_steps),
        )
    }

    /// Execute one rescaled action. Returns the action actually executed
    /// (adb failures degrade to a wait), the result message, and an
    /// optional terminal transition.
    async fn act(
        &self,
        device: &str,
        _session: &SessionWriter,
        step: u32,
        action: Action,
        current_app: &str,
        adb_failures: &mut u32,
    ) -> (Action, String, Option<(TaskState, Option<ErrorKind>, String)>) {
        match action {
            Action::Finish { ref message } => {
                // Return home so the phone is left tidy.
                let _ = self.deps.adb.keyevent(device, "KEYCODE_HOME").await;
                (
                    action.clone(),
                    message.clone(),
                    Some((TaskState::Succeeded, None, message.clone())),
                )
            }
            Action::RunScript { ref script, timeout_sec } => {
                match self.deps.script.execute(script, Some(timeout_sec)).await {
                    Ok(result) => {
                        let message = format!(
                            "Script {}: exit={:?} timed_out={} dir={}\nstdout: {}\nstderr: {}",
                            if result.ok { "succeeded" } else { "failed" },
                            result.exit_code,
                            result.timed_out,
                            result.run_dir,
                            first_chars(&result.stdout, 500),
                            first_chars(&result.stderr, 500),
                        );
                        (action.clone(), message, None)
                    }
                    Err(e) => (
                        action.clone(),
                        format!("script executor error: {}", e),
                        None,
                    ),
                }
            }
            Action::RequestHumanAuth { ref capability, ref instruction, timeout_sec } => {
                self.handle.set_state(TaskState::AwaitingAuth);
                let notify = self.notify.clone();
                let session_id = self
                    .handle
                    .session_path
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_ref()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let decision = self
                    .deps
                    .bridge
                    .request_and_wait(
                        self.handle.chat_id,
                        AuthRequest {
                            capability: capability.clone(),
                            instruction: instruction.clone(),
                            timeout_sec,
                            step,
                            session_id,
                            task: self.handle.text.clone(),
                            current_app: current_app.to_string(),
                        },
                        move |opened| notify(AgentEvent::AuthOpened(opened)),
                    )
                    .await;
                self.handle.set_state(TaskState::Running);
                match decision.status {
                    DecisionStatus::Approved => {
                        (action.clone(), format!("Authorized: {}", decision.message), None)
                    }
                    DecisionStatus::Rejected => (
                        action.clone(),
                        decision.message.clone(),
                        Some((
                            TaskState::Failed,
                            Some(ErrorKind::AuthRejected),
                            decision.message,
                        )),
                    ),
                    DecisionStatus::Timeout => (
                        action.clone(),
                        decision.message.clone(),
                        Some((
                            TaskState::Failed,
                            Some(ErrorKind::AuthTimeout),
                            decision.message,
                        )),
                    ),
                }
            }
            Action::Wait { duration_ms, ref reason } => {
                tokio::time::sleep(Duration::from_millis(duration_ms.min(60_000))).await;
                let message = if reason.is_empty() {
                    format!("Waited {}ms", duration_ms)
                } else {
                    format!("Waited {}ms ({})", duration_ms, reason)
                };
                (action.clone(), message, None)
            }
            ref device_action => {
                let result = match device_action {
                    Action::Tap { x, y } => self.deps.adb.tap(device, *x, *y).await,
                    Action::Swipe { x1, y1, x2, y2, duration_ms } => {
                        self.deps
                            .adb
                            .swipe(device, *x1, *y1, *x2, *y2, *duration_ms)
                            .await
                    }
                    Action::Type { text } => self.deps.adb.type_text(device, text).await,
                    Action::Keyevent { keycode } => self.deps.adb.keyevent(device, keycode).await,
                    Action::LaunchApp { package_name } => {
                        self.deps.adb.launch_app(device, package_name).await
                    }
                    Action::Shell { command } => self.deps.adb.shell(device, command).await,
                    _ => unreachable!("handled above"),
                };
                match result {
                    Ok(message) => {
                        *adb_failures = 0;
                        (device_action.clone(), message, None)
                    }
                    Err(e) => {
                        *adb_failures += 1;
                        if *adb_failures >= MAX_ADB_FAILURES {
                            return (
                                device_action.clone(),
                                e.to_string(),
                                Some((
                                    TaskState::Failed,
                                    Some(ErrorKind::AdbFailed),
                                    format!("adb failed {} times in a row: {}", adb_failures, e),
                                )),
                            );
                        }
                        // Degrade to a recoverable wait step.
                        warn!("adb failure (attempt {}): {}", adb_failures, e);
                        let wait = Action::Wait { duration_ms: 1000, reason: e.to_string() };
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                        (wait, e.to_string(), None)
                    }
                }
            }
        }
    }

    fn check_cancelled(
        &self,
        _step: u32,
        session: &SessionWriter,
        memory: &MemoryWriter,
    ) -> Option<()> {
        if !self.handle.is_cancelled() {
            return None;
        }
        let _ = session.append_error(ErrorKind::Cancelled, "cancelled by user");
        let _ = memory.append_task_summary(
            &self.handle.text,
            "cancelled",
            "cancelled by user",
            &session.path,
        );
        self.handle.set_state(TaskState::Cancelled);
        Some(())
    }

    fn cancelled_outcome(&self, session: &SessionWriter, steps: u32) -> TaskOutcome {
        TaskOutcome {
            state: TaskState::Cancelled,
            error: Some(ErrorKind::Cancelled),
            message: "Task cancelled.".into(),
            steps,
            session_path: Some(session.path.clone()),
        }
    }

    fn admission_failure(&self, kind: ErrorKind, message: &str) -> TaskOutcome {
        // Even rejected tasks leave a session + memory trace.
        let config = &self.deps.config;
        let outcome_path = SessionWriter::create(
            &PathBuf::from(&config.paths.workspace).join("sessions"),
            &PathBuf::from(&config.paths.state).join("screenshots"),
            config.screenshots.max_count,
            &self.handle.text,
            &self.handle.model,
        )
        .ok()
        .map(|session| {
            let _ = session.append_error(kind, message);
            let memory =
                MemoryWriter::new(&PathBuf::from(&config.paths.workspace).join("memory"));
            let _ = memory.append_task_summary(
                &self.handle.text,
                "failed",
                &format!("{}: {}", kind, message),
                &session.path,
            );
            session.path
        });
        self.handle.set_state(TaskState::Failed);
        TaskOutcome {
            state: TaskState::Failed,
            error: Some(kind),
            message: message.to_string(),
            steps: 0,
            session_path: outcome_path,
        }
    }

    fn finish(
        &self,
        session: &SessionWriter,
        memory: &MemoryWriter,
        state: TaskState,
        error: Option<ErrorKind>,
        message: &str,
    ) -> TaskOutcome {
        let outcome_word = match state {
            TaskState::Succeeded => "succeeded",
            TaskState::Cancelled => "cancelled",
            _ => "failed",
        };
        let terminal_message = match error {
            Some(kind) => format!("{}: {}", kind, message),
            None => message.to_string(),
        };
        let _ = session.append_terminal(outcome_word, &terminal_message);
        let _ = memory.append_task_summary(
            &self.handle.text,
            outcome_word,
            &terminal_message,
            &session.path,
        );
        self.handle.set_state(state);
        info!(
            "task {} {}: {}",
            self.handle.id, outcome_word, first_line(&terminal_message)
        );
        TaskOutcome {
            state,
            error,
            message: message.to_string(),
            steps: self.handle.step_count.load(Ordering::SeqCst),
            session_path: Some(session.path.clone()),
        }
    }
}

/// PROMPT.md and AGENTS.md from the workspace feed the system prompt.
fn load_workspace_prompts(workspace: &str) -> Vec<(String, String)> {
    ["PROMPT.md", "AGENTS.md"]
        .iter()
        .filter_map(|name| {
            let content =
                std::fs::read_to_string(PathBuf::from(workspace).join(name)).ok()?;
            Some((name.to_string(), content))
        })
        .collect()
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn first_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_detects_repetition() {
        let mut ring = FingerprintRing::new();
        let tap = Action::Tap { x: 100, y: 200 };
        // Three identical records in the window trip the detector.
        assert!(!ring.is_looping(&tap));
        ring.record(&tap);
        assert!(!ring.is_looping(&tap));
        ring.record(&tap);
        assert!(!ring.is_looping(&tap));
        ring.record(&tap);
        assert!(ring.is_looping(&tap));
    }

    #[test]
    fn test_ring_nearby_taps_share_coarse_target() {
        let mut ring = FingerprintRing::new();
        // All inside the same 32px bucket.
        for (x, y) in [(100, 200), (110, 210), (98, 205)] {
            ring.record(&Action::Tap { x, y });
        }
        assert!(ring.is_looping(&Action::Tap { x: 105, y: 202 }));
        // A tap in a different bucket is fine.
        assert!(!ring.is_looping(&Action::Tap { x: 600, y: 900 }));
    }

    #[test]
    fn test_ring_mixed_actions_do_not_trigger() {
        let mut ring = FingerprintRing::new();
        ring.record(&Action::Tap { x: 100, y: 200 });
        ring.record(&Action::Keyevent { keycode: "KEYCODE_BACK".into() });
        ring.record(&Action::Tap { x: 100, y: 200 });
        ring.record(&Action::Swipe { x1: 0, y1: 0, x2: 10, y2: 10, duration_ms: 300 });
        assert!(!ring.is_looping(&Action::Tap { x: 100, y: 200 }));
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut ring = FingerprintRing::new();
        for i in 0..50 {
            ring.record(&Action::Tap { x: i * 40, y: 0 });
        }
        assert!(ring.entries.len() <= FINGERPRINT_RING);
    }

    #[test]
    fn test_task_handle_lifecycle() {
        let handle = TaskHandle::new(Some(5), "open settings", "gpt-4o-mini");
        assert_eq!(handle.state(), TaskState::Queued);
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_first_helpers() {
        assert_eq!(first_line("a\nb"), "a");
        assert_eq!(first_chars("hello", 3), "hel…");
        assert_eq!(first_chars("hi", 3), "hi");
    }
}
