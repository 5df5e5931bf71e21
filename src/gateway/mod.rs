pub mod intent;
pub mod sanitize;

use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::adb::AdbClient;
use crate::agent::{AgentDeps, AgentEvent, AgentLoop, TaskHandle, TaskState};
use crate::bridge::HumanAuthBridge;
use crate::config::Config;
use crate::cron::{CronJob, CronScheduler, SubmitFn};
use crate::emulator::EmulatorManager;
use crate::heartbeat::Heartbeat;
use crate::logbuf::{LogBuffer, LogCategory};
use crate::paths::Paths;
use crate::relay::{self, RelayServerConfig};
use crate::script::ScriptExecutor;
use crate::skills::SkillLoader;
use crate::telegram::TelegramClient;
use crate::tunnel::TunnelSupervisor;

use intent::Intent;
use sanitize::sanitize_outbound;

/// Why the gateway stopped; the supervisor decides what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    Restart,
}

/// The command menu registered with the chat provider on startup.
const COMMANDS: &[(&str, &str)] = &[
    ("help", "Show available commands"),
    ("status", "Runtime status"),
    ("model", "Show or switch the model"),
    ("startvm", "Start the emulator"),
    ("stopvm", "Stop the emulator"),
    ("hidevm", "Hide the emulator window"),
    ("showvm", "Show the emulator window"),
    ("screen", "Send a screenshot"),
    ("skills", "List available skills"),
    ("clear", "Drop queued tasks"),
    ("reset", "Reset chat state"),
    ("stop", "Cancel the running task"),
    ("restart", "Restart the gateway"),
    ("cronrun", "Run a cron job now"),
    ("run", "Queue a phone task"),
    ("auth", "Pending approvals"),
];

struct QueuedTask {
    text: String,
    model: Option<String>,
}

/// Long-running gateway: long-poll ingestion, command routing, task
/// admission, the human-auth stack, heartbeat, and cron. Create with
/// [`Gateway::start`]; the returned handle stops it.
pub struct Gateway {
    config: Arc<Config>,
    adb: AdbClient,
    emulator: EmulatorManager,
    bridge: Arc<HumanAuthBridge>,
    script: ScriptExecutor,
    skills: SkillLoader,
    telegram: Option<TelegramClient>,
    /// Wired after construction; its submit callback loops back into
    /// admission.
    cron: OnceLock<Arc<CronScheduler>>,
    pub log: Arc<LogBuffer>,
    /// At-most-one running/awaiting task per chat id.
    active: DashMap<i64, Arc<TaskHandle>>,
    /// `/run` submissions waiting behind the active task.
    queue: DashMap<i64, VecDeque<QueuedTask>>,
    /// Tasks with no chat (cron jobs without chatId).
    chatless: Mutex<Vec<Arc<TaskHandle>>>,
    /// Runtime-only model override set by `/model`.
    model_override: Mutex<Option<String>>,
    stop_tx: watch::Sender<Option<StopReason>>,
}

/// Handle returned by [`Gateway::start`].
pub struct RunningGateway {
    pub gateway: Arc<Gateway>,
    stop_rx: watch::Receiver<Option<StopReason>>,
    /// Relay, cron, heartbeat, dashboard, and long-poll workers; aborted
    /// once the gateway has drained so a restart can rebind its ports.
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningGateway {
    /// Ask the gateway to stop; idempotent.
    pub fn stop(&self, reason: StopReason) {
        let _ = self.gateway.stop_tx.send(Some(reason));
    }

    /// Wait until the gateway stops and return the reason.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.stop_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::Shutdown;
            }
        }
    }

    pub fn abort_background(&self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}

impl Gateway {
    /// Build and start every gateway concern. Fails only on
    /// unrecoverable startup problems (the supervisor exits non-zero).
    pub async fn start(config: Arc<Config>, paths: Paths) -> anyhow::Result<RunningGateway> {
        paths.ensure_layout()?;
        let log = Arc::new(LogBuffer::new());

        let adb = AdbClient::new(Some(config.emulator.device.clone()));
        let emulator = EmulatorManager::new(config.emulator.clone(), adb.clone());
        let script = ScriptExecutor::new(
            config.script_executor.clone(),
            PathBuf::from(&config.paths.workspace).join("scripts").join("runs"),
        );
        let skills = SkillLoader::new(&paths.home, &PathBuf::from(&config.paths.workspace));

        // ── Human-auth stack: relay + optional tunnel + bridge ──────
        let relay_config = RelayServerConfig {
            host: "127.0.0.1".into(),
            port: config.human_auth.local_relay_port,
            public_base_url: config.human_auth.public_base_url.clone(),
            api_key: config.human_auth.resolve_api_key().unwrap_or_default(),
            state_file: paths.relay_state_file(),
        };
        let relay_port = relay_config.port;
        let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        background.push(tokio::spawn(async move {
            if let Err(e) = relay::serve(relay_config).await {
                error!("human-auth relay stopped: {}", e);
            }
        }));

        let mut bridge_config = config.human_auth.clone();
        if bridge_config.relay_base_url.is_empty() {
            bridge_config.relay_base_url = format!("http://127.0.0.1:{}", relay_port);
        }
        if config.human_auth.tunnel.enabled {
            let tunnel = TunnelSupervisor::new(config.human_auth.tunnel.clone(), relay_port);
            match tunnel.start().await {
                Ok(url) => {
                    log.push(LogCategory::HumanAuth, format!("tunnel up: {}", url));
                    bridge_config.public_base_url = url;
                }
                Err(e) => {
                    log.push(
                        LogCategory::Warn,
                        format!("tunnel failed, approvals stay local: {}", e),
                    );
                }
            }
        }
        let bridge = Arc::new(HumanAuthBridge::new(
            bridge_config,
            paths.auth_artifacts_dir(),
        ));

        let telegram = config
            .telegram
            .resolve_token()
            .map(|token| TelegramClient::new(token, config.telegram.poll_timeout_sec));
        if telegram.is_none() {
            log.push(
                LogCategory::Warn,
                "no Telegram token configured; chat surface disabled",
            );
        }

        let (stop_tx, stop_rx) = watch::channel(None);

        let gateway = Arc::new(Gateway {
            config: config.clone(),
            adb,
            emulator,
            bridge,
            script,
            skills,
            telegram,
            cron: OnceLock::new(),
            log: log.clone(),
            active: DashMap::new(),
            queue: DashMap::new(),
            chatless: Mutex::new(Vec::new()),
            model_override: Mutex::new(None),
            stop_tx,
        });

        // Cron submissions reuse the `/run` admission path.
        let cron_gateway = gateway.clone();
        let submit: SubmitFn = Arc::new(move |job: CronJob| {
            let gw = cron_gateway.clone();
            Box::pin(async move {
                gw.log.push(
                    LogCategory::Cron,
                    format!("job '{}' due: {}", job.id, job.task),
                );
                let reply = admit_task(&gw, job.chat_id, &job.task, job.model_profile, true).await;
                if let Some(chat_id) = job.chat_id {
                    gw.send(chat_id, &reply).await;
                }
            })
        });
        let cron = Arc::new(CronScheduler::new(
            paths.cron_jobs_file(),
            config.cron.tick_sec,
            submit,
        ));
        let _ = gateway.cron.set(cron.clone());

        // ── Background units ────────────────────────────────────────
        background.push(tokio::spawn(cron.run()));

        let hb_gateway = gateway.clone();
        let heartbeat = Heartbeat::new(
            config.heartbeat.clone(),
            Arc::new(move || hb_gateway.task_snapshot()),
            log.clone(),
        );
        background.push(tokio::spawn(heartbeat.run()));

        // Integrated dashboard: read-only snapshot over the gateway state.
        let dash_gateway = gateway.clone();
        let dash_state = crate::dashboard::DashboardState {
            adb: gateway.adb.clone(),
            emulator: gateway.emulator.clone(),
            gateway_status: Some(Arc::new(move || dash_gateway.runtime_snapshot())),
            log: Some(log.clone()),
        };
        let dash_host = config.dashboard.host.clone();
        let dash_port = config.dashboard.port;
        background.push(tokio::spawn(async move {
            if let Err(e) = crate::dashboard::serve(&dash_host, dash_port, dash_state).await {
                warn!("dashboard API stopped: {}", e);
            }
        }));

        if let Some(telegram) = gateway.telegram.clone() {
            let poll_gateway = gateway.clone();
            let poll_stop = stop_rx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = telegram.delete_webhook().await {
                    warn!("deleteWebhook failed: {}", e);
                }
                if let Err(e) = telegram.set_my_commands(COMMANDS).await {
                    warn!("setMyCommands failed: {}", e);
                } else {
                    poll_gateway
                        .log
                        .push(LogCategory::Gateway, "command menu registered");
                }
                long_poll_loop(poll_gateway, telegram, poll_stop).await;
            }));
        }

        log.push(LogCategory::Gateway, "gateway started");
        Ok(RunningGateway { gateway, stop_rx, background })
    }

    async fn status_text(&self, chat_id: i64) -> String {
        let emulator = self.emulator.status().await;
        let active = self.active.get(&chat_id);
        let queued = self.queue.get(&chat_id).map(|q| q.len()).unwrap_or(0);
        let pending_auth = self.bridge.list_pending().len();

        let mut out = String::new();
        match emulator {
            Ok(status) => {
                out.push_str(&format!(
                    "Emulator: {} booted of {} device(s)\n",
                    status.booted_devices.len(),
                    status.devices.len()
                ));
            }
            Err(e) => out.push_str(&format!("Emulator: unavailable ({})\n", e)),
        }
        match active {
            Some(task) => out.push_str(&format!(
                "Task: {:?} at step {} — {}\n",
                task.state(),
                task.step_count.load(std::sync::atomic::Ordering::SeqCst),
                task.text
            )),
            None => out.push_str("Task: none\n"),
        }
        out.push_str(&format!("Queued: {}\n", queued));
        out.push_str(&format!("Pending approvals: {}", pending_auth));
        out
    }

    async fn capture_screen(&self) -> anyhow::Result<Vec<u8>> {
        let device = self.adb.select_device(None).await?;
        self.adb.capture_screenshot(&device).await
    }

    fn is_chat_busy(&self, chat_id: i64) -> bool {
        self.active
            .get(&chat_id)
            .map(|t| {
                matches!(
                    t.state(),
                    TaskState::Queued | TaskState::Running | TaskState::AwaitingAuth
                )
            })
            .unwrap_or(false)
    }

    fn current_model_override(&self) -> Option<String> {
        self.model_override
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// All outbound chat text funnels through the sanitizer.
    pub async fn send(&self, chat_id: i64, text: &str) {
        let clean = sanitize_outbound(text);
        if clean.is_empty() {
            return;
        }
        if let Some(tg) = &self.telegram {
            if let Err(e) = tg.send_message(chat_id, &clean).await {
                self.log
                    .push(LogCategory::Error, format!("send to {} failed: {}", chat_id, e));
            }
        }
    }

    /// Every live task, for the heartbeat and dashboard.
    pub fn task_snapshot(&self) -> Vec<Arc<TaskHandle>> {
        let mut tasks: Vec<Arc<TaskHandle>> =
            self.active.iter().map(|kv| kv.value().clone()).collect();
        tasks.extend(
            self.chatless
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .cloned(),
        );
        tasks
    }

    /// Runtime snapshot consumed by the dashboard callback.
    pub fn runtime_snapshot(&self) -> serde_json::Value {
        let tasks: Vec<serde_json::Value> = self
            .task_snapshot()
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "chatId": t.chat_id,
                    "state": t.state(),
                    "step": t.step_count.load(std::sync::atomic::Ordering::SeqCst),
                    "startedAt": t.started_at.to_rfc3339(),
                })
            })
            .collect();
        serde_json::json!({
            "running": true,
            "tasks": tasks,
            "pendingApprovals": self.bridge.list_pending().len(),
        })
    }

    /// Cooperative shutdown: flag every task cancelled so the loops exit
    /// at their next persistence checkpoint.
    pub fn cancel_all_tasks(&self) {
        for task in self.task_snapshot() {
            task.cancel();
        }
    }
}

// ── Long-poll ingestion ─────────────────────────────────────────────────────

async fn long_poll_loop(
    gw: Arc<Gateway>,
    telegram: TelegramClient,
    mut stop: watch::Receiver<Option<StopReason>>,
) {
    let mut offset: i64 = 0;
    loop {
        if stop.borrow().is_some() {
            info!("long-poll loop stopping");
            return;
        }
        let poll = telegram.get_updates(offset, gw.config.telegram.poll_timeout_sec);
        let updates = tokio::select! {
            result = poll => match result {
                Ok(u) => u,
                Err(e) => {
                    gw.log.push(LogCategory::Warn, format!("long-poll error: {}", e));
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            },
            _ = stop.changed() => continue,
        };
        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else { continue };
            let Some(text) = message.text.clone() else { continue };
            let chat_id = message.chat.id;

            // Admission by chat id; empty list = open.
            let allowed = &gw.config.telegram.allowed_chat_ids;
            if !allowed.is_empty() && !allowed.contains(&chat_id) {
                gw.log.push(
                    LogCategory::Warn,
                    format!("dropped message from disallowed chat {}", chat_id),
                );
                continue;
            }

            let task_gw = gw.clone();
            tokio::spawn(async move {
                handle_message(task_gw, chat_id, text).await;
            });
        }
    }
}

async fn handle_message(gw: Arc<Gateway>, chat_id: i64, text: String) {
    let trimmed = text.trim();
    gw.log
        .push(LogCategory::Gateway, format!("[{}] {}", chat_id, trimmed));

    if trimmed.starts_with('/') {
        let reply = handle_command(&gw, chat_id, trimmed).await;
        if !reply.is_empty() {
            gw.send(chat_id, &reply).await;
        }
        return;
    }

    match intent::classify(trimmed) {
        Intent::Task => {
            let reply = admit_task(&gw, Some(chat_id), trimmed, None, false).await;
            gw.send(chat_id, &reply).await;
        }
        Intent::Chat => {
            gw.send(
                chat_id,
                "I drive your phone. Tell me what to do (e.g. \"open settings and \
                 enable dark mode\") or /help for commands.",
            )
            .await;
        }
    }
}

// ── Command routing ─────────────────────────────────────────────────────────

async fn handle_command(gw: &Arc<Gateway>, chat_id: i64, command: &str) -> String {
    let mut parts = command.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "/help" => COMMANDS
            .iter()
            .map(|(cmd, desc)| format!("/{} — {}", cmd, desc))
            .collect::<Vec<_>>()
            .join("\n"),
        "/status" => gw.status_text(chat_id).await,
        "/model" => {
            if rest.is_empty() {
                let current = gw
                    .current_model_override()
                    .unwrap_or_else(|| gw.config.default_model.clone());
                let known: Vec<&str> = gw.config.models.keys().map(|s| s.as_str()).collect();
                format!("Model: {} (available: {})", current, known.join(", "))
            } else if gw.config.models.contains_key(rest) {
                *gw.model_override.lock().unwrap_or_else(|p| p.into_inner()) =
                    Some(rest.to_string());
                format!("Model switched to {}", rest)
            } else {
                format!(
                    "Unknown model '{}'. Available: {}",
                    rest,
                    gw.config.models.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            }
        }
        "/startvm" => gw
            .emulator
            .start(true)
            .await
            .unwrap_or_else(|e| format!("Emulator start failed: {}", e)),
        "/stopvm" => gw
            .emulator
            .stop()
            .await
            .unwrap_or_else(|e| format!("Emulator stop failed: {}", e)),
        "/hidevm" => gw
            .emulator
            .hide_window()
            .await
            .unwrap_or_else(|e| format!("Hide failed: {}", e)),
        "/showvm" => gw
            .emulator
            .show_window()
            .await
            .unwrap_or_else(|e| format!("Show failed: {}", e)),
        "/screen" => match gw.capture_screen().await {
            Ok(png) => {
                if let Some(tg) = &gw.telegram {
                    match tg.send_photo(chat_id, png, "Current screen").await {
                        Ok(()) => String::new(),
                        Err(e) => format!("Could not send screenshot: {}", e),
                    }
                } else {
                    "Screenshot captured (no chat transport to send it)".into()
                }
            }
            Err(e) => format!("Screenshot failed: {}", e),
        },
        "/skills" => {
            let skills = gw.skills.load();
            if skills.is_empty() {
                "No skills installed.".into()
            } else {
                skills
                    .iter()
                    .map(|s| format!("{} ({:?}): {}", s.name, s.source, s.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "/clear" => {
            let dropped = gw
                .queue
                .get_mut(&chat_id)
                .map(|mut q| {
                    let n = q.len();
                    q.clear();
                    n
                })
                .unwrap_or(0);
            format!("Dropped {} queued task(s).", dropped)
        }
        "/reset" => {
            gw.queue.remove(&chat_id);
            *gw.model_override.lock().unwrap_or_else(|p| p.into_inner()) = None;
            "Chat state reset.".into()
        }
        "/stop" => match gw.active.get(&chat_id) {
            Some(task) => {
                task.cancel();
                "Cancelling the running task…".into()
            }
            None => "No task running.".into(),
        },
        "/restart" => {
            let _ = gw.stop_tx.send(Some(StopReason::Restart));
            "Restarting the gateway…".into()
        }
        "/cronrun" => {
            let Some(cron) = gw.cron.get() else {
                return "Cron scheduler not running.".into();
            };
            if rest.is_empty() {
                let jobs = cron.list_jobs();
                if jobs.is_empty() {
                    "No cron jobs configured.".into()
                } else {
                    jobs.iter()
                        .map(|j| {
                            format!(
                                "{} — every {}s{} — {}",
                                j.id,
                                j.every_sec,
                                if j.enabled { "" } else { " (disabled)" },
                                j.task
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            } else if cron.run_job_now(rest).await {
                format!("Cron job '{}' submitted.", rest)
            } else {
                format!("No enabled cron job '{}'.", rest)
            }
        }
        "/run" => {
            if rest.is_empty() {
                "Usage: /run <task>".into()
            } else {
                admit_task(gw, Some(chat_id), rest, None, true).await
            }
        }
        "/auth" => handle_auth_command(gw, rest).await,
        other => format!("Unknown command {}. /help lists commands.", other),
    }
}

async fn handle_auth_command(gw: &Arc<Gateway>, rest: &str) -> String {
    let mut parts = rest.splitn(3, ' ');
    let sub = parts.next().unwrap_or("");
    match sub {
        "" | "pending" => {
            let pending = gw.bridge.list_pending();
            if pending.is_empty() {
                "No pending approvals.".into()
            } else {
                pending
                    .iter()
                    .map(|p| {
                        let mut line = format!(
                            "{} — {} (step {}): {}",
                            p.id, p.capability, p.step, p.instruction
                        );
                        if let Some(url) = &p.open_url {
                            line.push_str(&format!("\n  {}", url));
                        }
                        line.push_str(&format!(
                            "\n  /auth approve {}  |  /auth reject {}",
                            p.id, p.id
                        ));
                        line
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "approve" | "reject" => {
            let Some(id) = parts.next() else {
                return format!("Usage: /auth {} <id> [note]", sub);
            };
            let note = parts.next().unwrap_or("");
            let approved = sub == "approve";
            let delivered = gw
                .bridge
                .resolve_pending(
                    id,
                    approved,
                    if note.is_empty() { None } else { Some(note) },
                    "chat",
                )
                .await;
            if delivered {
                gw.log.push(
                    LogCategory::HumanAuth,
                    format!("request {} {} via chat", id, sub),
                );
                format!("Request {} {}.", id, if approved { "approved" } else { "rejected" })
            } else {
                format!("No pending request '{}' (already resolved?).", id)
            }
        }
        other => format!("Unknown /auth subcommand '{}'.", other),
    }
}

// ── Admission & task lifecycle ──────────────────────────────────────────────

/// Admit a task. `queue_if_busy` is true on the `/run` path (and for
/// cron submissions); plain-text submissions are rejected while a task
/// is active for the chat.
pub async fn admit_task(
    gw: &Arc<Gateway>,
    chat_id: Option<i64>,
    text: &str,
    model: Option<String>,
    queue_if_busy: bool,
) -> String {
    let model_name = model.or_else(|| gw.current_model_override());
    let (resolved_model, profile, warning) = gw.config.resolve_profile(model_name.as_deref());

    // Surface a missing secret at admission, never mid-task.
    if profile.resolve_secret().is_none() {
        return format!(
            "Cannot start: no API key for model '{}' (secret_missing). \
             Set models.{}.apiKey or the {} environment variable.",
            resolved_model,
            resolved_model,
            if profile.api_key_env.is_empty() { "apiKeyEnv" } else { &profile.api_key_env }
        );
    }

    if let Some(chat) = chat_id {
        if gw.is_chat_busy(chat) {
            if queue_if_busy {
                let mut queue = gw.queue.entry(chat).or_default();
                queue.push_back(QueuedTask {
                    text: text.to_string(),
                    model: Some(resolved_model.clone()),
                });
                return format!(
                    "A task is already running; queued at position {}.",
                    queue.len()
                );
            }
            return "A task is already running for this chat. Use /run to queue it, \
                    or /stop to cancel the current one."
                .into();
        }
    }

    spawn_task(gw, chat_id, text, &resolved_model);
    let mut reply = format!("Started task with {}: {}", resolved_model, text);
    if let Some(w) = warning {
        reply = format!("{}\n{}", w, reply);
    }
    reply
}

fn spawn_task(gw: &Arc<Gateway>, chat_id: Option<i64>, text: &str, model: &str) {
    let handle = TaskHandle::new(chat_id, text, model);
    match chat_id {
        Some(chat) => {
            gw.active.insert(chat, handle.clone());
        }
        None => {
            gw.chatless
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(handle.clone());
        }
    }

    let gw = gw.clone();
    tokio::spawn(async move {
        let deps = AgentDeps {
            config: gw.config.clone(),
            adb: gw.adb.clone(),
            bridge: gw.bridge.clone(),
            script: gw.script.clone(),
            skills: gw.skills.clone(),
        };
        let notify_gw = gw.clone();
        let notify_chat = handle.chat_id;
        let notify: Arc<dyn Fn(AgentEvent) + Send + Sync> = Arc::new(move |event| {
            let gw = notify_gw.clone();
            tokio::spawn(async move {
                on_agent_event(&gw, notify_chat, event).await;
            });
        });
        let outcome = AgentLoop::new(deps, handle.clone(), notify).run().await;

        // Report the outcome to the chat.
        if let Some(chat) = handle.chat_id {
            let text = match outcome.state {
                TaskState::Succeeded => format!("Done: {}", outcome.message),
                TaskState::Cancelled => "Task cancelled.".to_string(),
                _ => format!(
                    "Task failed ({}): {}",
                    outcome.error.map(|k| k.as_str()).unwrap_or("internal"),
                    outcome.message
                ),
            };
            gw.send(chat, &text).await;
            gw.active.remove(&chat);
            drain_queue(&gw, chat).await;
        } else {
            let mut chatless = gw.chatless.lock().unwrap_or_else(|p| p.into_inner());
            chatless.retain(|t| t.id != handle.id);
        }
    });
}

async fn drain_queue(gw: &Arc<Gateway>, chat_id: i64) {
    let next = gw.queue.get_mut(&chat_id).and_then(|mut q| q.pop_front());
    if let Some(queued) = next {
        gw.send(chat_id, &format!("Starting queued task: {}", queued.text))
            .await;
        let reply = admit_task(gw, Some(chat_id), &queued.text, queued.model, true).await;
        gw.log
            .push(LogCategory::Gateway, format!("queue drain: {}", reply));
    }
}

async fn on_agent_event(gw: &Arc<Gateway>, chat_id: Option<i64>, event: AgentEvent) {
    match event {
        AgentEvent::AuthOpened(opened) => {
            gw.log.push(
                LogCategory::HumanAuth,
                format!("approval {} opened ({})", opened.id, opened.capability),
            );
            let Some(chat) = opened.chat_id.or(chat_id) else { return };
            let mut text = format!(
                "Approval needed ({}): {}\n",
                opened.capability, opened.instruction
            );
            if let Some(url) = &opened.open_url {
                text.push_str(&format!("Approve from any device: {}\n", url));
            }
            text.push_str(&format!(
                "Or reply: /auth approve {}  |  /auth reject {}\nTimes out in {}s.",
                opened.id, opened.id, opened.timeout_sec
            ));
            gw.send(chat, &text).await;
        }
        AgentEvent::Progress { step: _, message } => {
            gw.log.push(LogCategory::Gateway, message.clone());
            if let Some(chat) = chat_id {
                gw.send(chat, &message).await;
            }
        }
    }
}
