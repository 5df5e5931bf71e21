use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use base64::Engine;

use crate::config::HumanAuthConfig;

// ── Public types ────────────────────────────────────────────────────────────

/// What an agent step asks the human to approve.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub capability: String,
    pub instruction: String,
    pub timeout_sec: u64,
    pub step: u32,
    pub session_id: String,
    pub task: String,
    pub current_app: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Approved,
    Rejected,
    Timeout,
}

/// Exactly one of these is delivered per pending request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub approved: bool,
    pub status: DecisionStatus,
    pub message: String,
    pub decided_at: DateTime<Utc>,
    pub artifact_path: Option<String>,
}

/// Context handed to the gateway when a request opens, so it can DM the
/// link and the manual fallback commands.
#[derive(Debug, Clone)]
pub struct OpenedAuth {
    pub id: String,
    pub chat_id: Option<i64>,
    pub capability: String,
    pub instruction: String,
    pub timeout_sec: u64,
    pub open_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub id: String,
    pub chat_id: Option<i64>,
    pub task: String,
    pub capability: String,
    pub instruction: String,
    pub step: u32,
    pub expires_at: DateTime<Utc>,
    pub open_url: Option<String>,
}

// ── Internals ───────────────────────────────────────────────────────────────

struct PendingEntry {
    chat_id: Option<i64>,
    task: String,
    capability: String,
    instruction: String,
    step: u32,
    expires_at: DateTime<Utc>,
    open_url: Option<String>,
    /// Taken exactly once; whoever takes it delivers the decision.
    settle: Mutex<Option<oneshot::Sender<Decision>>>,
}

/// In-process pending-approval table. Three decision sources converge on
/// one settle channel per entry: the relay poll, the chat fallback
/// (`/auth approve|reject`), and the timeout timer. First one wins;
/// later attempts are no-ops.
pub struct HumanAuthBridge {
    config: HumanAuthConfig,
    artifacts_dir: PathBuf,
    pending: DashMap<String, Arc<PendingEntry>>,
    client: reqwest::Client,
}

impl HumanAuthBridge {
    pub fn new(config: HumanAuthConfig, artifacts_dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            // Deadline for one relay call or poll iteration.
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            artifacts_dir,
            pending: DashMap::new(),
            client,
        }
    }

    pub fn list_pending(&self) -> Vec<PendingSummary> {
        self.pending
            .iter()
            .map(|kv| PendingSummary {
                id: kv.key().clone(),
                chat_id: kv.chat_id,
                task: kv.task.clone(),
                capability: kv.capability.clone(),
                instruction: kv.instruction.clone(),
                step: kv.step,
                expires_at: kv.expires_at,
                open_url: kv.open_url.clone(),
            })
            .collect()
    }

    /// Chat-fallback resolution. Returns true when this call delivered
    /// the decision; false when the id is unknown or already settled.
    pub async fn resolve_pending(
        &self,
        id: &str,
        approved: bool,
        note: Option<&str>,
        actor: &str,
    ) -> bool {
        let Some(entry) = self.pending.get(id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let status = if approved {
            DecisionStatus::Approved
        } else {
            DecisionStatus::Rejected
        };
        let message = match note {
            Some(n) if !n.is_empty() => format!(
                "{} by {}: {}",
                if approved { "Approved" } else { "Rejected" },
                actor,
                n
            ),
            _ => format!(
                "{} by {}",
                if approved { "Approved" } else { "Rejected" },
                actor
            ),
        };
        self.settle(
            &entry,
            Decision {
                id: id.to_string(),
                approved,
                status,
                message,
                decided_at: Utc::now(),
                artifact_path: None,
            },
        )
        .await
    }

    /// Create a pending entry and block until exactly one decision
    /// arrives from the relay poll, the chat fallback, or the timeout.
    pub async fn request_and_wait(
        &self,
        chat_id: Option<i64>,
        request: AuthRequest,
        on_opened: impl FnOnce(OpenedAuth),
    ) -> Decision {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<Decision>();

        let timeout = Duration::from_millis((request.timeout_sec * 1000).max(500));
        let expires_at = Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64);

        // Try to open the request on the remote relay first so the entry
        // carries its open URL from the start. Relay being down only
        // removes that surface; the timer and chat fallback still work.
        let mut open_url = None;
        let mut poll_token = None;
        if !self.config.relay_base_url.is_empty() {
            match self.relay_create(&id, chat_id, &request).await {
                Ok((url, token)) => {
                    open_url = Some(url);
                    poll_token = Some(token);
                }
                Err(e) => {
                    warn!(
                        "{}: continuing with chat fallback and timer: {}",
                        crate::errors::ErrorKind::RelayUnreachable,
                        e
                    );
                }
            }
        }

        let entry = Arc::new(PendingEntry {
            chat_id,
            task: request.task.clone(),
            capability: request.capability.clone(),
            instruction: request.instruction.clone(),
            step: request.step,
            expires_at,
            open_url: open_url.clone(),
            settle: Mutex::new(Some(tx)),
        });
        self.pending.insert(id.clone(), entry.clone());
        info!("auth request {} pending (capability={})", id, request.capability);

        on_opened(OpenedAuth {
            id: id.clone(),
            chat_id,
            capability: request.capability.clone(),
            instruction: request.instruction.clone(),
            timeout_sec: request.timeout_sec,
            open_url: open_url.clone(),
        });

        // Timeout timer.
        let timer = {
            let bridge_entry = entry.clone();
            let id = id.clone();
            let timeout_sec = request.timeout_sec;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let decision = Decision {
                    id: id.clone(),
                    approved: false,
                    status: DecisionStatus::Timeout,
                    message: format!(
                        "Human authorization timed out after {}s",
                        timeout_sec
                    ),
                    decided_at: Utc::now(),
                    artifact_path: None,
                };
                settle_entry(&bridge_entry, decision).await;
            })
        };

        // Background relay poll.
        let poller = poll_token.map(|token| {
            let entry = entry.clone();
            let id = id.clone();
            let base = self.config.relay_base_url.trim_end_matches('/').to_string();
            let interval = Duration::from_millis(self.config.poll_interval_ms);
            let client = self.client.clone();
            let artifacts_dir = self.artifacts_dir.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let url = format!(
                        "{}/v1/human-auth/requests/{}?pollToken={}",
                        base, id, token
                    );
                    let body: serde_json::Value = match client.get(&url).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            match resp.json().await {
                                Ok(b) => b,
                                Err(_) => continue,
                            }
                        }
                        _ => continue,
                    };
                    let status = body["status"].as_str().unwrap_or("pending");
                    if status == "pending" {
                        continue;
                    }
                    let approved = status == "approved";
                    let note = body["note"].as_str().unwrap_or("").to_string();
                    let artifact_path =
                        save_artifact(&artifacts_dir, &id, &body["artifact"]);
                    let decision = Decision {
                        id: id.clone(),
                        approved,
                        status: match status {
                            "approved" => DecisionStatus::Approved,
                            "timeout" => DecisionStatus::Timeout,
                            _ => DecisionStatus::Rejected,
                        },
                        message: if note.is_empty() {
                            format!("Remote decision: {}", status)
                        } else {
                            format!("Remote decision: {} ({})", status, note)
                        },
                        decided_at: Utc::now(),
                        artifact_path,
                    };
                    settle_entry(&entry, decision).await;
                    break;
                }
            })
        });

        // Exactly one decision arrives; a dropped channel cannot happen
        // because the timer task holds a sender path until it settles.
        let decision = rx.await.unwrap_or_else(|_| Decision {
            id: id.clone(),
            approved: false,
            status: DecisionStatus::Timeout,
            message: "authorization channel closed".into(),
            decided_at: Utc::now(),
            artifact_path: None,
        });

        timer.abort();
        if let Some(p) = poller {
            p.abort();
        }
        self.pending.remove(&id);
        info!("auth request {} settled: {:?}", id, decision.status);
        decision
    }

    async fn settle(&self, entry: &Arc<PendingEntry>, decision: Decision) -> bool {
        settle_entry(entry, decision).await
    }

    async fn relay_create(
        &self,
        id: &str,
        chat_id: Option<i64>,
        request: &AuthRequest,
    ) -> anyhow::Result<(String, String)> {
        let url = format!(
            "{}/v1/human-auth/requests",
            self.config.relay_base_url.trim_end_matches('/')
        );
        let mut req = self.client.post(&url).json(&serde_json::json!({
            "requestId": id,
            "chatId": chat_id,
            "task": request.task,
            "sessionId": request.session_id,
            "step": request.step,
            "capability": request.capability,
            "instruction": request.instruction,
            "timeoutSec": request.timeout_sec,
            "currentApp": request.current_app,
            "publicBaseUrl": if self.config.public_base_url.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(self.config.public_base_url)
            },
        }));
        if let Some(key) = self.config.resolve_api_key() {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("relay create returned {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await?;
        let open_url = body["openUrl"].as_str().unwrap_or("").to_string();
        let poll_token = body["pollToken"].as_str().unwrap_or("").to_string();
        if open_url.is_empty() || poll_token.is_empty() {
            anyhow::bail!("relay create response missing openUrl/pollToken");
        }
        Ok((open_url, poll_token))
    }
}

/// Take the settle sender; only the first caller delivers.
async fn settle_entry(entry: &Arc<PendingEntry>, decision: Decision) -> bool {
    let sender = entry.settle.lock().await.take();
    match sender {
        Some(tx) => tx.send(decision).is_ok(),
        None => false,
    }
}

/// Persist a relay-returned artifact as
/// `state/human-auth-artifacts/<id>.<ext>`.
fn save_artifact(dir: &PathBuf, id: &str, artifact: &serde_json::Value) -> Option<String> {
    let mime = artifact["mimeType"].as_str()?;
    let b64 = artifact["base64"].as_str()?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    let ext = match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "application/json" => "json",
        _ => "bin",
    };
    if std::fs::create_dir_all(dir).is_err() {
        return None;
    }
    let path = dir.join(format!("{}.{}", id, ext));
    match std::fs::write(&path, bytes) {
        Ok(()) => Some(path.to_string_lossy().into_owned()),
        Err(e) => {
            warn!("artifact write failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_without_relay(timeout_poll_ms: u64) -> HumanAuthBridge {
        let config = HumanAuthConfig {
            relay_base_url: String::new(),
            poll_interval_ms: timeout_poll_ms,
            ..Default::default()
        };
        HumanAuthBridge::new(config, std::env::temp_dir().join("op-test-artifacts"))
    }

    fn sample_request(timeout_sec: u64) -> AuthRequest {
        AuthRequest {
            capability: "payment".into(),
            instruction: "Approve the charge".into(),
            timeout_sec,
            step: 4,
            session_id: "s1".into(),
            task: "order coffee".into(),
            current_app: "com.coffee.app".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_decision() {
        let bridge = Arc::new(bridge_without_relay(500));
        let decision = bridge
            .request_and_wait(Some(1), sample_request(1), |_| {})
            .await;
        assert!(!decision.approved);
        assert_eq!(decision.status, DecisionStatus::Timeout);
        assert!(decision.message.contains("timed out"));
        // Pending table is empty afterward.
        assert!(bridge.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_chat_fallback_resolution() {
        let bridge = Arc::new(bridge_without_relay(500));
        let bridge2 = bridge.clone();
        let (id_tx, id_rx) = oneshot::channel::<String>();

        let waiter = tokio::spawn(async move {
            bridge2
                .request_and_wait(Some(9), sample_request(30), move |opened| {
                    let _ = id_tx.send(opened.id);
                })
                .await
        });

        let id = id_rx.await.unwrap();
        assert_eq!(bridge.list_pending().len(), 1);

        // First resolve wins, second is a no-op.
        assert!(bridge.resolve_pending(&id, true, Some("fine"), "owner").await);
        assert!(!bridge.resolve_pending(&id, false, None, "owner").await);

        let decision = waiter.await.unwrap();
        assert!(decision.approved);
        assert_eq!(decision.status, DecisionStatus::Approved);
        assert!(decision.message.contains("owner"));
        assert!(bridge.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_returns_false() {
        let bridge = bridge_without_relay(500);
        assert!(!bridge.resolve_pending("nope", true, None, "owner").await);
    }

    #[tokio::test]
    async fn test_opened_context_carries_request_fields() {
        let bridge = Arc::new(bridge_without_relay(500));
        let bridge2 = bridge.clone();
        let (tx, rx) = oneshot::channel::<OpenedAuth>();
        let waiter = tokio::spawn(async move {
            bridge2
                .request_and_wait(Some(2), sample_request(30), move |opened| {
                    let _ = tx.send(opened);
                })
                .await
        });
        let opened = rx.await.unwrap();
        assert_eq!(opened.capability, "payment");
        assert_eq!(opened.chat_id, Some(2));
        assert!(opened.open_url.is_none()); // no relay configured

        bridge.resolve_pending(&opened.id, false, None, "owner").await;
        let decision = waiter.await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Rejected);
    }

    #[test]
    fn test_save_artifact_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let artifact = serde_json::json!({
            "mimeType": "image/png",
            "base64": base64::engine::general_purpose::STANDARD.encode(b"pngdata"),
        });
        let path = save_artifact(&dir_path, "abc", &artifact).unwrap();
        assert!(path.ends_with("abc.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"pngdata");

        let unknown = serde_json::json!({
            "mimeType": "application/octet-stream",
            "base64": base64::engine::general_purpose::STANDARD.encode(b"x"),
        });
        let path = save_artifact(&dir_path, "other", &unknown).unwrap();
        assert!(path.ends_with("other.bin"));

        assert!(save_artifact(&dir_path, "none", &serde_json::Value::Null).is_none());
    }
}
