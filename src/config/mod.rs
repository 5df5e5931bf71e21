use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::paths::{absolutize, write_atomic, Paths};

// ── Model profiles ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelProfile {
    #[serde(alias = "base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(alias = "api_key")]
    pub api_key: String,
    #[serde(alias = "api_key_env")]
    pub api_key_env: String,
    #[serde(alias = "max_tokens")]
    pub max_tokens: u32,
    /// One of "low", "medium", "high", "xhigh", or empty (omitted).
    #[serde(alias = "reasoning_effort")]
    pub reasoning_effort: String,
    pub temperature: Option<f32>,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: String::new(),
            api_key_env: "OPENAI_API_KEY".into(),
            max_tokens: 2048,
            reasoning_effort: String::new(),
            temperature: None,
        }
    }
}

impl ModelProfile {
    /// Secret precedence: in-config key, then env named by `apiKeyEnv`,
    /// then the Codex credential file under the provider home.
    /// A missing secret surfaces at task admission, never silently.
    pub fn resolve_secret(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        if !self.api_key_env.is_empty() {
            if let Ok(v) = std::env::var(&self.api_key_env) {
                if !v.is_empty() {
                    return Some(v);
                }
            }
        }
        codex_credential_fallback()
    }

    /// Claude-family profiles get a different screenshot scaling target.
    pub fn is_claude_like(&self) -> bool {
        let m = self.model.to_lowercase();
        m.contains("claude") || self.base_url.contains("anthropic")
    }
}

/// Provider-specific credential fallback: `~/.codex/auth.json` carries an
/// OPENAI_API_KEY field or an OAuth access token.
fn codex_credential_fallback() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    let path = PathBuf::from(home).join(".codex").join("auth.json");
    let content = std::fs::read_to_string(path).ok()?;
    let val: serde_json::Value = serde_json::from_str(&content).ok()?;
    if let Some(key) = val.get("OPENAI_API_KEY").and_then(|v| v.as_str()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    val.pointer("/tokens/access_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

// ── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Forced to "en" on load.
    pub lang: String,
    #[serde(alias = "max_steps")]
    pub max_steps: u32,
    #[serde(alias = "loop_delay_ms")]
    pub loop_delay_ms: u64,
    #[serde(alias = "progress_report_interval")]
    pub progress_report_interval: u32,
    /// Packages treated as system permission dialogs; seeing one in the
    /// foreground triggers human-auth escalation on the next plan step.
    #[serde(alias = "permission_controller_packages")]
    pub permission_controller_packages: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            lang: "en".into(),
            max_steps: 50,
            loop_delay_ms: 1200,
            progress_report_interval: 5,
            permission_controller_packages: vec![
                "com.google.android.permissioncontroller".into(),
                "com.android.permissioncontroller".into(),
                "com.android.packageinstaller".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmulatorConfig {
    #[serde(alias = "avd_name")]
    pub avd_name: String,
    /// Pinned adb device id; empty = auto-select.
    pub device: String,
    #[serde(alias = "boot_timeout_sec")]
    pub boot_timeout_sec: u64,
    pub headless: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            avd_name: String::new(),
            device: String::new(),
            boot_timeout_sec: 120,
            headless: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenshotsConfig {
    #[serde(alias = "max_count")]
    pub max_count: usize,
}

impl Default for ScreenshotsConfig {
    fn default() -> Self {
        Self { max_count: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptExecutorConfig {
    #[serde(alias = "allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(alias = "timeout_sec")]
    pub timeout_sec: u64,
    #[serde(alias = "max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ScriptExecutorConfig {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "adb", "echo", "cat", "ls", "grep", "head", "tail", "wc",
                "sort", "uniq", "cut", "date", "sleep", "curl", "jq", "printf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_sec: 60,
            max_output_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    #[serde(alias = "every_sec")]
    pub every_sec: u64,
    #[serde(alias = "stuck_task_warn_sec")]
    pub stuck_task_warn_sec: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { every_sec: 30, stuck_task_warn_sec: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronConfig {
    #[serde(alias = "tick_sec")]
    pub tick_sec: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { tick_sec: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// External tunneling binary, e.g. "ngrok".
    pub binary: String,
    #[serde(alias = "api_base")]
    pub api_base: String,
    #[serde(alias = "startup_timeout_sec")]
    pub startup_timeout_sec: u64,
    #[serde(alias = "authtoken_env")]
    pub authtoken_env: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: "ngrok".into(),
            api_base: String::new(),
            startup_timeout_sec: 15,
            authtoken_env: "NGROK_AUTHTOKEN".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HumanAuthConfig {
    /// Remote relay base URL; empty = chat-fallback + timer only.
    #[serde(alias = "relay_base_url")]
    pub relay_base_url: String,
    #[serde(alias = "local_relay_port")]
    pub local_relay_port: u16,
    #[serde(alias = "request_timeout_sec")]
    pub request_timeout_sec: u64,
    #[serde(alias = "poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(alias = "api_key")]
    pub api_key: String,
    #[serde(alias = "api_key_env")]
    pub api_key_env: String,
    #[serde(alias = "public_base_url")]
    pub public_base_url: String,
    pub tunnel: TunnelConfig,
}

impl Default for HumanAuthConfig {
    fn default() -> Self {
        Self {
            relay_base_url: String::new(),
            local_relay_port: 8787,
            request_timeout_sec: 300,
            poll_interval_ms: 2000,
            api_key: String::new(),
            api_key_env: String::new(),
            public_base_url: String::new(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl HumanAuthConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        if !self.api_key_env.is_empty() {
            if let Ok(v) = std::env::var(&self.api_key_env) {
                if !v.is_empty() {
                    return Some(v);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramConfig {
    #[serde(alias = "bot_token")]
    pub bot_token: String,
    #[serde(alias = "bot_token_env")]
    pub bot_token_env: String,
    /// Empty = open to any chat.
    #[serde(alias = "allowed_chat_ids")]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(alias = "poll_timeout_sec")]
    pub poll_timeout_sec: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            bot_token_env: "TELEGRAM_BOT_TOKEN".into(),
            allowed_chat_ids: Vec::new(),
            poll_timeout_sec: 30,
        }
    }
}

impl TelegramConfig {
    pub fn resolve_token(&self) -> Option<String> {
        if !self.bot_token.is_empty() {
            return Some(self.bot_token.clone());
        }
        if !self.bot_token_env.is_empty() {
            if let Ok(v) = std::env::var(&self.bot_token_env) {
                if !v.is_empty() {
                    return Some(v);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 8420 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    /// Workspace root (sessions, memory, scripts, cron, skills).
    pub workspace: String,
    /// State root (screenshots, relay state, artifacts).
    pub state: String,
}

// ── Top level ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agent: AgentConfig,
    pub emulator: EmulatorConfig,
    pub screenshots: ScreenshotsConfig,
    #[serde(alias = "script_executor")]
    pub script_executor: ScriptExecutorConfig,
    pub heartbeat: HeartbeatConfig,
    pub cron: CronConfig,
    #[serde(alias = "human_auth")]
    pub human_auth: HumanAuthConfig,
    pub telegram: TelegramConfig,
    pub dashboard: DashboardConfig,
    pub paths: PathsConfig,
    pub models: BTreeMap<String, ModelProfile>,
    #[serde(alias = "default_model")]
    pub default_model: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert("gpt-4o-mini".to_string(), ModelProfile::default());
        Self {
            agent: AgentConfig::default(),
            emulator: EmulatorConfig::default(),
            screenshots: ScreenshotsConfig::default(),
            script_executor: ScriptExecutorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cron: CronConfig::default(),
            human_auth: HumanAuthConfig::default(),
            telegram: TelegramConfig::default(),
            dashboard: DashboardConfig::default(),
            paths: PathsConfig::default(),
            models,
            default_model: "gpt-4o-mini".into(),
        }
    }
}

impl Config {
    /// Two-phase load: deep-merge the on-disk JSON over defaults, then
    /// clamp/normalize. Missing or legacy keys never raise. A missing file
    /// is created with defaults; a normalized file is rewritten in
    /// canonical camelCase form.
    pub fn load(paths: &Paths) -> anyhow::Result<Self> {
        let file = paths.config_file();
        if !file.exists() {
            let config = Self::default().normalized(paths);
            config.save(&file)?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(&file)?;
        let parsed: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("config.json malformed ({}); rewriting from defaults", e);
                serde_json::Value::Object(serde_json::Map::new())
            }
        };
        // Legacy snake_case keys are folded onto their canonical names
        // before the merge so they override defaults instead of sitting
        // beside them.
        let parsed = camelize_keys(parsed, false);

        let mut base = serde_json::to_value(Self::default())?;
        deep_merge(&mut base, &parsed);
        let config: Self = serde_json::from_value(base).unwrap_or_default();
        let config = config.normalized(paths);

        // Rewrite so legacy keys disappear from disk.
        config.save(&file)?;
        Ok(config)
    }

    /// Atomic, pretty-printed, sorted-keys write.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Round-trip through Value: serde_json's map is ordered, so the
        // output keys come out sorted.
        let value = serde_json::to_value(self)?;
        let pretty = serde_json::to_string_pretty(&value)?;
        write_atomic(path, pretty.as_bytes())?;
        Ok(())
    }

    /// Apply lower bounds to every numeric field, absolutize path fields,
    /// force `agent.lang = "en"`, and guarantee `defaultModel ∈ models`.
    fn normalized(mut self, paths: &Paths) -> Self {
        self.agent.lang = "en".into();
        self.agent.max_steps = self.agent.max_steps.max(1);
        self.agent.loop_delay_ms = self.agent.loop_delay_ms.max(100);
        self.agent.progress_report_interval = self.agent.progress_report_interval.max(1);
        self.emulator.boot_timeout_sec = self.emulator.boot_timeout_sec.max(10);
        self.screenshots.max_count = self.screenshots.max_count.max(20);
        self.script_executor.timeout_sec = self.script_executor.timeout_sec.max(1);
        self.script_executor.max_output_chars = self.script_executor.max_output_chars.max(1000);
        self.heartbeat.every_sec = self.heartbeat.every_sec.max(5);
        self.heartbeat.stuck_task_warn_sec = self.heartbeat.stuck_task_warn_sec.max(30);
        self.cron.tick_sec = self.cron.tick_sec.max(2);
        if self.human_auth.local_relay_port == 0 {
            self.human_auth.local_relay_port = HumanAuthConfig::default().local_relay_port;
        }
        self.human_auth.request_timeout_sec = self.human_auth.request_timeout_sec.max(30);
        self.human_auth.poll_interval_ms = self.human_auth.poll_interval_ms.max(500);
        self.human_auth.tunnel.startup_timeout_sec =
            self.human_auth.tunnel.startup_timeout_sec.max(3);
        self.telegram.poll_timeout_sec = self.telegram.poll_timeout_sec.clamp(1, 50);

        if self.paths.workspace.is_empty() {
            self.paths.workspace = paths.workspace_dir().to_string_lossy().into_owned();
        } else {
            self.paths.workspace =
                absolutize(&self.paths.workspace).to_string_lossy().into_owned();
        }
        if self.paths.state.is_empty() {
            self.paths.state = paths.state_dir().to_string_lossy().into_owned();
        } else {
            self.paths.state = absolutize(&self.paths.state).to_string_lossy().into_owned();
        }

        if self.models.is_empty() {
            self.models
                .insert("gpt-4o-mini".into(), ModelProfile::default());
        }
        if !self.models.contains_key(&self.default_model) {
            let first = self.models.keys().next().cloned().unwrap_or_default();
            warn!(
                "defaultModel '{}' not among models; using '{}'",
                self.default_model, first
            );
            self.default_model = first;
        }
        self
    }

    /// Resolve a model profile by name. Unknown names fall back to
    /// `defaultModel`; the returned warning line is recorded by the caller.
    pub fn resolve_profile(&self, name: Option<&str>) -> (String, ModelProfile, Option<String>) {
        match name {
            Some(n) if self.models.contains_key(n) => {
                (n.to_string(), self.models[n].clone(), None)
            }
            Some(n) => {
                let warning = format!(
                    "Unknown model '{}'; using default '{}'",
                    n, self.default_model
                );
                (
                    self.default_model.clone(),
                    self.models[&self.default_model].clone(),
                    Some(warning),
                )
            }
            None => (
                self.default_model.clone(),
                self.models[&self.default_model].clone(),
                None,
            ),
        }
    }
}

/// Rewrite snake_case object keys to camelCase, recursively. The keys of
/// the `models` map are user-chosen profile names and pass through
/// untouched (their nested profile fields are still rewritten).
fn camelize_keys(value: serde_json::Value, preserve_keys: bool) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                let preserve_children = key == "models";
                let new_key = if preserve_keys { key } else { snake_to_camel(&key) };
                out.insert(new_key, camelize_keys(v, preserve_children));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.into_iter().map(|v| camelize_keys(v, false)).collect(),
        ),
        other => other,
    }
}

fn snake_to_camel(key: &str) -> String {
    if !key.contains('_') {
        return key.to_string();
    }
    let mut parts = key.split('_').filter(|p| !p.is_empty());
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Recursive merge: object keys from `overlay` override `base`; non-object
/// values replace wholesale. Unknown future keys survive the merge and are
/// dropped by the typed parse, never raising.
fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(b), serde_json::Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => {
            *slot = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_home(dir.path().join("op"));
        paths.ensure_layout().unwrap();
        (dir, paths)
    }

    #[test]
    fn test_load_creates_default_file() {
        let (_dir, paths) = test_paths();
        let config = Config::load(&paths).unwrap();
        assert!(paths.config_file().exists());
        assert_eq!(config.agent.lang, "en");
        assert_eq!(config.agent.max_steps, 50);
        assert!(config.models.contains_key(&config.default_model));
    }

    #[test]
    fn test_snake_case_keys_normalized() {
        let (_dir, paths) = test_paths();
        std::fs::write(
            paths.config_file(),
            r#"{"agent":{"max_steps":10,"loop_delay_ms":1500},"script_executor":{"timeout_sec":5}}"#,
        )
        .unwrap();
        let config = Config::load(&paths).unwrap();
        assert_eq!(config.agent.max_steps, 10);
        assert_eq!(config.agent.loop_delay_ms, 1500);
        assert_eq!(config.script_executor.timeout_sec, 5);

        // Rewritten file is canonical camelCase.
        let rewritten = std::fs::read_to_string(paths.config_file()).unwrap();
        assert!(rewritten.contains("\"maxSteps\": 10"));
        assert!(!rewritten.contains("max_steps"));
    }

    #[test]
    fn test_numeric_clamps() {
        let (_dir, paths) = test_paths();
        std::fs::write(
            paths.config_file(),
            r#"{"screenshots":{"maxCount":1},"heartbeat":{"everySec":1,"stuckTaskWarnSec":2},"cron":{"tickSec":0},"humanAuth":{"requestTimeoutSec":5,"pollIntervalMs":10,"tunnel":{"startupTimeoutSec":1}},"scriptExecutor":{"maxOutputChars":10}}"#,
        )
        .unwrap();
        let config = Config::load(&paths).unwrap();
        assert_eq!(config.screenshots.max_count, 20);
        assert_eq!(config.heartbeat.every_sec, 5);
        assert_eq!(config.heartbeat.stuck_task_warn_sec, 30);
        assert_eq!(config.cron.tick_sec, 2);
        assert_eq!(config.human_auth.request_timeout_sec, 30);
        assert_eq!(config.human_auth.poll_interval_ms, 500);
        assert_eq!(config.human_auth.tunnel.startup_timeout_sec, 3);
        assert_eq!(config.script_executor.max_output_chars, 1000);
    }

    #[test]
    fn test_malformed_json_rewritten_from_defaults() {
        let (_dir, paths) = test_paths();
        std::fs::write(paths.config_file(), "{not json at all").unwrap();
        let config = Config::load(&paths).unwrap();
        assert_eq!(config.agent.max_steps, 50);
        // File now parses.
        let raw = std::fs::read_to_string(paths.config_file()).unwrap();
        serde_json::from_str::<serde_json::Value>(&raw).unwrap();
    }

    #[test]
    fn test_unknown_default_model_falls_back() {
        let (_dir, paths) = test_paths();
        std::fs::write(
            paths.config_file(),
            r#"{"defaultModel":"nope","models":{"a":{"model":"m-a"},"b":{"model":"m-b"}}}"#,
        )
        .unwrap();
        let config = Config::load(&paths).unwrap();
        assert_eq!(config.default_model, "a");
    }

    #[test]
    fn test_resolve_profile_unknown_warns() {
        let (_dir, paths) = test_paths();
        let config = Config::load(&paths).unwrap();
        let (name, _profile, warning) = config.resolve_profile(Some("does-not-exist"));
        assert_eq!(name, config.default_model);
        assert!(warning.unwrap().contains("does-not-exist"));
        let (_, _, none) = config.resolve_profile(None);
        assert!(none.is_none());
    }

    #[test]
    fn test_round_trip_is_stable() {
        let (_dir, paths) = test_paths();
        let first = Config::load(&paths).unwrap();
        let first_raw = std::fs::read_to_string(paths.config_file()).unwrap();
        let second = Config::load(&paths).unwrap();
        let second_raw = std::fs::read_to_string(paths.config_file()).unwrap();
        assert_eq!(first_raw, second_raw);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("max_steps"), "maxSteps");
        assert_eq!(snake_to_camel("poll_interval_ms"), "pollIntervalMs");
        assert_eq!(snake_to_camel("already"), "already");
    }

    #[test]
    fn test_model_profile_names_not_camelized() {
        let (_dir, paths) = test_paths();
        std::fs::write(
            paths.config_file(),
            r#"{"defaultModel":"local_llm","models":{"local_llm":{"model":"m","base_url":"http://localhost:1234/v1"}}}"#,
        )
        .unwrap();
        let config = Config::load(&paths).unwrap();
        assert!(config.models.contains_key("local_llm"));
        assert_eq!(config.default_model, "local_llm");
        assert_eq!(config.models["local_llm"].base_url, "http://localhost:1234/v1");
    }

    #[test]
    fn test_secret_precedence_config_over_env() {
        let profile = ModelProfile {
            api_key: "in-config".into(),
            api_key_env: "PATH".into(),
            ..Default::default()
        };
        assert_eq!(profile.resolve_secret().unwrap(), "in-config");
    }

    #[test]
    fn test_secret_env_fallback() {
        let profile = ModelProfile {
            api_key: String::new(),
            api_key_env: "PATH".into(), // always set in test environments
            ..Default::default()
        };
        assert!(profile.resolve_secret().is_some());
    }
}
