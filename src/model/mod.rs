use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::action::Action;
use crate::adb::ScreenSnapshot;
use crate::config::ModelProfile;
use crate::errors::{ErrorKind, TaskError};

/// Default deadline on one model HTTP call.
const MODEL_TIMEOUT: Duration = Duration::from_secs(90);

/// Latest history lines embedded into the step prompt.
const HISTORY_WINDOW: usize = 8;

/// Inputs for one planning call.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub task: &'a str,
    pub step: u32,
    pub max_steps: u32,
    pub snapshot: &'a ScreenSnapshot,
    /// One line per executed step, oldest first; only the tail is sent.
    pub history: &'a [String],
    /// Extra directive injected by the anti-loop heuristic.
    pub strategy_hint: Option<&'a str>,
}

/// One planned step: a normalized action plus the model's thought.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub thought: String,
    pub action: Action,
}

/// OpenAI-compatible chat client with image attachment and provider
/// fallback (chat/completions -> responses -> completions). The first
/// non-error reply wins; exhaustion surfaces as `model_failed`.
#[derive(Debug, Clone)]
pub struct ModelClient {
    profile: ModelProfile,
    api_key: String,
    client: reqwest::Client,
    system_prompt: String,
}

impl ModelClient {
    pub fn new(
        profile: ModelProfile,
        api_key: String,
        skill_catalog: &str,
        workspace_prompts: &[(String, String)],
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(MODEL_TIMEOUT)
            .build()
            .unwrap_or_default();
        let system_prompt = build_system_prompt(skill_catalog, workspace_prompts);
        Self { profile, api_key, client, system_prompt }
    }

    pub fn model_name(&self) -> &str {
        &self.profile.model
    }

    /// Plan one action for the current screen. Unparseable output is a
    /// planned `wait`, not an error.
    pub async fn plan(&self, req: &PlanRequest<'_>) -> anyhow::Result<PlannedStep> {
        let system = if let Some(hint) = req.strategy_hint {
            format!("{}\n\n{}", self.system_prompt, hint)
        } else {
            self.system_prompt.clone()
        };
        let user = build_step_prompt(req);
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&req.snapshot.png);

        let raw = self.complete(&system, &user, Some(&image_b64)).await?;
        Ok(parse_planned_step(&raw))
    }

    /// Walk the provider fallback chain; collect failures for the final
    /// error message.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        image_b64: Option<&str>,
    ) -> anyhow::Result<ModelReply> {
        let mut failures: Vec<String> = Vec::new();

        match self.chat_completions(system, user, image_b64).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                warn!("chat/completions failed: {}", e);
                failures.push(format!("chat: {}", e));
            }
        }
        match self.responses(system, user, image_b64).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                warn!("responses failed: {}", e);
                failures.push(format!("responses: {}", e));
            }
        }
        match self.completions(system, user).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                warn!("completions failed: {}", e);
                failures.push(format!("completions: {}", e));
            }
        }

        Err(TaskError::new(
            ErrorKind::ModelFailed,
            format!("all providers failed: {}", failures.join("; ")),
        )
        .into())
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    async fn chat_completions(
        &self,
        system: &str,
        user: &str,
        image_b64: Option<&str>,
    ) -> anyhow::Result<ModelReply> {
        let url = format!("{}/chat/completions", self.profile.base_url.trim_end_matches('/'));

        let user_content = if let Some(img) = image_b64 {
            json!([
                {"type": "text", "text": user},
                {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{}", img)}}
            ])
        } else {
            json!(user)
        };

        let mut body = json!({
            "model": self.profile.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content}
            ],
            "max_tokens": self.profile.max_tokens,
            "tools": [phone_action_tool()],
            "tool_choice": "auto",
        });
        if let Some(t) = self.profile.temperature {
            body["temperature"] = json!(t);
        }
        if !self.profile.reasoning_effort.is_empty() {
            body["reasoning_effort"] = json!(self.profile.reasoning_effort);
        }

        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                resp.status(),
                truncate(&resp.text().await.unwrap_or_default(), 300)
            );
        }
        let result: Value = resp.json().await?;
        let message = &result["choices"][0]["message"];

        // Structured tool arguments are preferred over free text.
        if let Some(args) = message["tool_calls"][0]["function"]["arguments"].as_str() {
            return Ok(ModelReply::ToolArguments(args.to_string()));
        }
        let content = message["content"].as_str().unwrap_or("");
        if content.is_empty() {
            anyhow::bail!("empty completion");
        }
        Ok(ModelReply::Text(content.to_string()))
    }

    async fn responses(
        &self,
        system: &str,
        user: &str,
        image_b64: Option<&str>,
    ) -> anyhow::Result<ModelReply> {
        let url = format!("{}/responses", self.profile.base_url.trim_end_matches('/'));

        let mut content = vec![json!({"type": "input_text", "text": user})];
        if let Some(img) = image_b64 {
            content.push(json!({
                "type": "input_image",
                "image_url": format!("data:image/png;base64,{}", img)
            }));
        }
        let body = json!({
            "model": self.profile.model,
            "instructions": system,
            "input": [{"type": "message", "role": "user", "content": content}],
            "max_output_tokens": self.profile.max_tokens,
        });

        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                resp.status(),
                truncate(&resp.text().await.unwrap_or_default(), 300)
            );
        }
        let result: Value = resp.json().await?;
        if let Some(text) = result["output_text"].as_str() {
            if !text.is_empty() {
                return Ok(ModelReply::Text(text.to_string()));
            }
        }
        // Walk the output array for the first text part.
        if let Some(items) = result["output"].as_array() {
            for item in items {
                if let Some(parts) = item["content"].as_array() {
                    for part in parts {
                        if let Some(text) = part["text"].as_str() {
                            if !text.is_empty() {
                                return Ok(ModelReply::Text(text.to_string()));
                            }
                        }
                    }
                }
            }
        }
        anyhow::bail!("no text in responses output")
    }

    async fn completions(&self, system: &str, user: &str) -> anyhow::Result<ModelReply> {
        let url = format!("{}/completions", self.profile.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.profile.model,
            "prompt": format!("{}\n\n{}", system, user),
            "max_tokens": self.profile.max_tokens,
        });
        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                resp.status(),
                truncate(&resp.text().await.unwrap_or_default(), 300)
            );
        }
        let result: Value = resp.json().await?;
        let text = result["choices"][0]["text"].as_str().unwrap_or("");
        if text.is_empty() {
            anyhow::bail!("empty completion");
        }
        Ok(ModelReply::Text(text.to_string()))
    }
}

enum ModelReply {
    /// JSON arguments from a structured tool call.
    ToolArguments(String),
    /// Free-form text that should contain a JSON object.
    Text(String),
}

/// The single function the model is asked to call.
fn phone_action_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "phone_action",
            "description": "Perform exactly one UI action on the phone.",
            "parameters": {
                "type": "object",
                "properties": {
                    "thought": {"type": "string", "description": "Brief reasoning for this step"},
                    "action": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": [
                                "tap", "swipe", "type", "keyevent", "launch_app",
                                "shell", "run_script", "request_human_auth",
                                "wait", "finish"
                            ]},
                            "x": {"type": "integer"},
                            "y": {"type": "integer"},
                            "x1": {"type": "integer"},
                            "y1": {"type": "integer"},
                            "x2": {"type": "integer"},
                            "y2": {"type": "integer"},
                            "durationMs": {"type": "integer"},
                            "text": {"type": "string"},
                            "keycode": {"type": "string"},
                            "packageName": {"type": "string"},
                            "command": {"type": "string"},
                            "script": {"type": "string"},
                            "timeoutSec": {"type": "integer"},
                            "capability": {"type": "string"},
                            "instruction": {"type": "string"},
                            "message": {"type": "string"}
                        },
                        "required": ["type"]
                    }
                },
                "required": ["action"]
            }
        }
    })
}

fn build_system_prompt(skill_catalog: &str, workspace_prompts: &[(String, String)]) -> String {
    let mut prompt = String::from(
        "You are a phone-use agent controlling an Android device through screenshots.\n\
         Each turn you see the current screen and reply with exactly ONE action.\n\
         Coordinates refer to the attached screenshot. Use `finish` when the task is done,\n\
         `request_human_auth` when a step needs the owner's approval (payments, permissions,\n\
         sign-ins), and `wait` when the screen is still loading.\n",
    );
    if !skill_catalog.is_empty() {
        prompt.push_str("\n");
        prompt.push_str(skill_catalog);
    }
    for (name, content) in workspace_prompts {
        if !content.trim().is_empty() {
            prompt.push_str(&format!("\n--- {} ---\n{}\n", name, content.trim()));
        }
    }
    prompt.push_str(
        "\nReply with a JSON object: {\"thought\": \"...\", \"action\": {\"type\": \"...\", ...}}.\n",
    );
    prompt
}

fn build_step_prompt(req: &PlanRequest<'_>) -> String {
    let snap = req.snapshot;
    let meta = json!({
        "currentApp": snap.current_app,
        "deviceWidth": snap.width_device,
        "deviceHeight": snap.height_device,
        "screenshotWidth": snap.width_scaled,
        "screenshotHeight": snap.height_scaled,
    });

    let mut prompt = format!(
        "Task: {}\nStep {}/{}\nScreen: {}\n",
        req.task, req.step, req.max_steps, meta
    );
    let tail_start = req.history.len().saturating_sub(HISTORY_WINDOW);
    let tail = &req.history[tail_start..];
    if !tail.is_empty() {
        prompt.push_str("\nRecent steps:\n");
        for line in tail {
            prompt.push_str(&format!("{}\n", line));
        }
    }
    prompt.push_str("\nWhat is the next single action?");
    prompt
}

/// Map a model reply onto a planned step. Anything unparseable becomes
/// the canonical invalid-output wait.
fn parse_planned_step(reply: &ModelReply) -> PlannedStep {
    let json_text = match reply {
        ModelReply::ToolArguments(args) => Some(args.clone()),
        ModelReply::Text(text) => extract_json(text),
    };

    let Some(json_text) = json_text else {
        debug!("no JSON object in model output");
        return PlannedStep {
            thought: String::new(),
            action: Action::invalid_model_output(),
        };
    };
    let Ok(value) = serde_json::from_str::<Value>(&json_text) else {
        debug!("model output JSON failed to parse");
        return PlannedStep {
            thought: String::new(),
            action: Action::invalid_model_output(),
        };
    };

    let thought = value
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let action_value = if value.get("action").map(|a| a.is_object()).unwrap_or(false) {
        value["action"].clone()
    } else if value.get("type").is_some() {
        value.clone()
    } else {
        return PlannedStep { thought, action: Action::invalid_model_output() };
    };

    PlannedStep { thought, action: Action::normalize(&action_value) }
}

/// Extract the first JSON object from free text: direct, fenced, or
/// embedded. Brace counting skips string contents.
fn extract_json(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }

    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut prev = ' ';
    for (i, c) in text[start..].char_indices() {
        if c == '"' && prev != '\\' {
            in_string = !in_string;
        }
        if !in_string {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start..start + i + c.len_utf8()].to_string());
                    }
                }
                _ => {}
            }
        }
        prev = c;
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
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
    fn test_extract_json_direct() {
        assert_eq!(
            extract_json(r#"{"type":"tap","x":1}"#).unwrap(),
            r#"{"type":"tap","x":1}"#
        );
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"type\": \"wait\"}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), "{\"type\": \"wait\"}");
    }

    #[test]
    fn test_extract_json_embedded_with_braces_in_strings() {
        let text = r#"Sure. {"thought":"tap the {x} button","action":{"type":"tap","x":5,"y":6}} trailing"#;
        let json = extract_json(text).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["action"]["type"], "tap");
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_parse_planned_step_wrapped_action() {
        let reply = ModelReply::Text(
            r#"{"thought":"open settings","action":{"type":"launch_app","packageName":"com.android.settings"}}"#.into(),
        );
        let step = parse_planned_step(&reply);
        assert_eq!(step.thought, "open settings");
        assert_eq!(
            step.action,
            Action::LaunchApp { package_name: "com.android.settings".into() }
        );
    }

    #[test]
    fn test_parse_planned_step_bare_action() {
        let reply = ModelReply::Text(r#"{"type":"tap","x":10,"y":20,"thought":"hit ok"}"#.into());
        let step = parse_planned_step(&reply);
        assert_eq!(step.thought, "hit ok");
        assert_eq!(step.action, Action::Tap { x: 10, y: 20 });
    }

    #[test]
    fn test_parse_planned_step_malformed_becomes_wait() {
        let reply = ModelReply::Text("I would tap the button, probably.".into());
        let step = parse_planned_step(&reply);
        assert_eq!(step.action, Action::invalid_model_output());
        match &step.action {
            Action::Wait { duration_ms, reason } => {
                assert_eq!(*duration_ms, 1000);
                assert_eq!(reason, "model output was not valid");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_planned_step_tool_arguments() {
        let reply = ModelReply::ToolArguments(
            r#"{"thought":"confirm","action":{"type":"keyevent","keycode":"KEYCODE_ENTER"}}"#.into(),
        );
        let step = parse_planned_step(&reply);
        assert_eq!(step.action, Action::Keyevent { keycode: "KEYCODE_ENTER".into() });
    }

    #[test]
    fn test_step_prompt_history_window() {
        let snapshot = ScreenSnapshot {
            device_id: "emulator-5554".into(),
            current_app: "com.android.launcher".into(),
            width_device: 1080,
            height_device: 1920,
            width_scaled: 768,
            height_scaled: 1365,
            scale_x: 1080.0 / 768.0,
            scale_y: 1920.0 / 1365.0,
            captured_at: chrono::Utc::now(),
            png: Vec::new(),
        };
        let history: Vec<String> = (1..=12).map(|i| format!("step {}", i)).collect();
        let req = PlanRequest {
            task: "open settings",
            step: 13,
            max_steps: 50,
            snapshot: &snapshot,
            history: &history,
            strategy_hint: None,
        };
        let prompt = build_step_prompt(&req);
        assert!(prompt.contains("step 12"));
        assert!(prompt.contains("step 5"));
        assert!(!prompt.contains("step 4\n"));
        assert!(prompt.contains("\"currentApp\""));
    }

    #[test]
    fn test_system_prompt_includes_skills_and_workspace() {
        let prompts = vec![("PROMPT.md".to_string(), "Always be polite.".to_string())];
        let system = build_system_prompt("Available skills:\n- Timer: sets timers\n", &prompts);
        assert!(system.contains("Timer"));
        assert!(system.contains("Always be polite."));
    }
}
