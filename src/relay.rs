use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::paths::write_atomic;

// ── State file model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPayload {
    pub mime_type: String,
    pub base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEntry {
    pub chat_id: Option<i64>,
    pub task: String,
    pub session_id: String,
    pub step: u32,
    pub capability: String,
    pub instruction: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub current_app: String,
    #[serde(default)]
    pub screenshot_path: Option<String>,
    pub timeout_sec: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Credential the bridge polls with.
    pub poll_token: String,
    /// One-time credential embedded in the human-facing link.
    pub open_token: String,
    /// pending | approved | rejected | timeout
    pub status: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact: Option<ArtifactPayload>,
}

impl RelayEntry {
    fn is_open(&self) -> bool {
        self.status == "pending"
    }
}

/// On-disk map `id -> entry`; every mutation rewrites the file atomically.
#[derive(Debug)]
struct RelayStore {
    path: PathBuf,
    entries: BTreeMap<String, RelayEntry>,
}

impl RelayStore {
    fn open(path: PathBuf) -> Self {
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    fn persist(&self) {
        match serde_json::to_string_pretty(&self.entries) {
            Ok(raw) => {
                if let Err(e) = write_atomic(&self.path, raw.as_bytes()) {
                    warn!("relay state write failed: {}", e);
                }
            }
            Err(e) => warn!("relay state serialize failed: {}", e),
        }
    }

    /// Lazily flip expired pending entries to `timeout`.
    fn refresh_expiry(&mut self, id: &str) {
        let now = Utc::now();
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.is_open() && entry.expires_at <= now {
                entry.status = "timeout".into();
                entry.decided_at = Some(now);
                self.persist();
            }
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub host: String,
    pub port: u16,
    /// Base for the human-facing open URL; empty = http://host:port.
    pub public_base_url: String,
    /// Bearer key; empty = unauthenticated mode.
    pub api_key: String,
    pub state_file: PathBuf,
}

#[derive(Clone)]
struct RelayState {
    store: Arc<Mutex<RelayStore>>,
    config: Arc<RelayServerConfig>,
}

pub fn build_router(config: RelayServerConfig) -> Router {
    let state = RelayState {
        store: Arc::new(Mutex::new(RelayStore::open(config.state_file.clone()))),
        config: Arc::new(config),
    };
    Router::new()
        .route("/v1/human-auth/requests", post(create_request))
        .route("/v1/human-auth/requests/:id", get(poll_request))
        .route("/v1/human-auth/requests/:id/resolve", post(resolve_request))
        .route("/human-auth/:id", get(approval_page))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the process exits. The standalone
/// `human-auth-relay start` verb lands here, and the gateway spawns the
/// same router in-process.
pub async fn serve(config: RelayServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let router = build_router(config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("human-auth relay listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

// ── Error envelope ──────────────────────────────────────────────────────────

fn api_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"code": code, "message": message}})),
    )
        .into_response()
}

fn check_bearer(state: &RelayState, headers: &HeaderMap) -> Result<(), Response> {
    if state.config.api_key.is_empty() {
        return Ok(());
    }
    let expected = format!("Bearer {}", state.config.api_key);
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(got) if got == expected => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "unauthorized", "bad bearer token")),
    }
}

// ── Handlers ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    request_id: Option<String>,
    chat_id: Option<i64>,
    task: String,
    session_id: String,
    step: u32,
    capability: String,
    instruction: String,
    #[serde(default)]
    reason: String,
    timeout_sec: u64,
    #[serde(default)]
    current_app: String,
    #[serde(default)]
    screenshot_path: Option<String>,
    #[serde(default)]
    public_base_url: Option<String>,
}

async fn create_request(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Response {
    if let Err(resp) = check_bearer(&state, &headers) {
        return resp;
    }

    let id = body
        .request_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = Utc::now();
    let timeout_sec = body.timeout_sec.max(1);
    let entry = RelayEntry {
        chat_id: body.chat_id,
        task: body.task,
        session_id: body.session_id,
        step: body.step,
        capability: body.capability,
        instruction: body.instruction,
        reason: body.reason,
        current_app: body.current_app,
        screenshot_path: body.screenshot_path,
        timeout_sec,
        created_at: now,
        expires_at: now + chrono::Duration::seconds(timeout_sec as i64),
        poll_token: uuid::Uuid::new_v4().to_string(),
        open_token: uuid::Uuid::new_v4().to_string(),
        status: "pending".into(),
        note: String::new(),
        decided_at: None,
        artifact: None,
    };

    let base = body
        .public_base_url
        .filter(|s| !s.is_empty())
        .or_else(|| {
            (!state.config.public_base_url.is_empty())
                .then(|| state.config.public_base_url.clone())
        })
        .unwrap_or_else(|| {
            format!("http://{}:{}", state.config.host, state.config.port)
        });
    let open_url = format!(
        "{}/human-auth/{}?token={}",
        base.trim_end_matches('/'),
        id,
        entry.open_token
    );

    let mut store = state.store.lock().await;
    let response = serde_json::json!({
        "requestId": id,
        "openUrl": open_url,
        "pollToken": entry.poll_token,
        "expiresAt": entry.expires_at.to_rfc3339(),
    });
    store.entries.insert(id.clone(), entry);
    store.persist();
    info!("relay: created auth request {}", id);
    Json(response).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollQuery {
    poll_token: Option<String>,
}

async fn poll_request(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
) -> Response {
    let mut store = state.store.lock().await;
    store.refresh_expiry(&id);
    let Some(entry) = store.entries.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "not_found", "unknown request id");
    };

    // Either the per-request poll token or the bearer key authorizes a poll.
    let token_ok = query
        .poll_token
        .as_deref()
        .map(|t| t == entry.poll_token)
        .unwrap_or(false);
    if !token_ok {
        if let Err(resp) = check_bearer(&state, &headers) {
            return resp;
        }
    }

    let mut body = serde_json::json!({
        "requestId": id,
        "status": entry.status,
    });
    if !entry.note.is_empty() {
        body["note"] = serde_json::json!(entry.note);
    }
    if let Some(decided) = entry.decided_at {
        body["decidedAt"] = serde_json::json!(decided.to_rfc3339());
    }
    if let Some(artifact) = &entry.artifact {
        body["artifact"] = serde_json::json!({
            "mimeType": artifact.mime_type,
            "base64": artifact.base64,
        });
    }
    Json(body).into_response()
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    approved: bool,
    #[serde(default)]
    note: String,
    #[serde(default)]
    artifact: Option<ArtifactPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolveQuery {
    token: Option<String>,
}

/// Accepts both the API (JSON + bearer) and the approval page's form
/// post (urlencoded + one-time token).
async fn resolve_request(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Query(query): Query<ResolveQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let parsed: ResolveBody = if is_form {
        let fields = decode_form(&body);
        ResolveBody {
            approved: fields.get("approved").map(|v| v == "true").unwrap_or(false),
            note: fields.get("note").cloned().unwrap_or_default(),
            artifact: None,
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    &format!("invalid body: {}", e),
                )
            }
        }
    };

    let mut store = state.store.lock().await;
    store.refresh_expiry(&id);
    let Some(entry) = store.entries.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "not_found", "unknown request id");
    };

    // One-time open token (from the approval page) or bearer key.
    let token_ok = query
        .token
        .as_deref()
        .map(|t| t == entry.open_token)
        .unwrap_or(false);
    if !token_ok {
        if let Err(resp) = check_bearer(&state, &headers) {
            return resp;
        }
    }
    if !entry.is_open() {
        return api_error(
            StatusCode::CONFLICT,
            "already_resolved",
            &format!("request already {}", entry.status),
        );
    }

    let status = if parsed.approved { "approved" } else { "rejected" };
    if let Some(entry) = store.entries.get_mut(&id) {
        entry.status = status.into();
        entry.note = parsed.note;
        entry.decided_at = Some(Utc::now());
        entry.artifact = parsed.artifact;
    }
    store.persist();
    info!("relay: request {} {}", id, status);

    if is_form {
        Html(format!(
            "<html><body><h2>Decision recorded</h2><p>The request was {}.</p></body></html>",
            status
        ))
        .into_response()
    } else {
        Json(serde_json::json!({"ok": true})).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    token: Option<String>,
}

/// Human-facing approval page; authorized solely by the one-time token.
async fn approval_page(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    let mut store = state.store.lock().await;
    store.refresh_expiry(&id);
    let Some(entry) = store.entries.get(&id) else {
        return (StatusCode::NOT_FOUND, Html("<h2>Unknown request</h2>".to_string()))
            .into_response();
    };
    let token = query.token.unwrap_or_default();
    if token != entry.open_token {
        return (StatusCode::UNAUTHORIZED, Html("<h2>Invalid link</h2>".to_string()))
            .into_response();
    }
    if !entry.is_open() {
        return Html(format!(
            "<html><body><h2>Already {}</h2></body></html>",
            entry.status
        ))
        .into_response();
    }

    let action = format!("/v1/human-auth/requests/{}/resolve?token={}", id, token);
    Html(format!(
        r#"<!doctype html>
<html><head><title>Approval required</title></head><body>
<h2>Approval required</h2>
<p><b>Task:</b> {task}</p>
<p><b>Capability:</b> {capability}</p>
<p><b>Step {step}:</b> {instruction}</p>
<p><b>App:</b> {app}</p>
<form method="post" action="{action}">
  <input type="text" name="note" placeholder="Optional note" />
  <button type="submit" name="approved" value="true">Approve</button>
  <button type="submit" name="approved" value="false">Reject</button>
</form>
</body></html>"#,
        task = html_escape(&entry.task),
        capability = html_escape(&entry.capability),
        step = entry.step,
        instruction = html_escape(&entry.instruction),
        app = html_escape(&entry.current_app),
        action = action,
    ))
    .into_response()
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

// ── Small helpers ───────────────────────────────────────────────────────────

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal application/x-www-form-urlencoded decoder for the approval
/// page's two fields.
fn decode_form(body: &[u8]) -> BTreeMap<String, String> {
    let text = String::from_utf8_lossy(body);
    let mut out = BTreeMap::new();
    for pair in text.split('&') {
        let mut kv = pair.splitn(2, '=');
        let key = percent_decode(kv.next().unwrap_or(""));
        let value = percent_decode(kv.next().unwrap_or(""));
        if !key.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(v) = u8::from_str_radix(hex, 16) {
                    out.push(v);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir, api_key: &str) -> RelayServerConfig {
        RelayServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            public_base_url: "https://relay.example.com".into(),
            api_key: api_key.into(),
            state_file: dir.path().join("requests.json"),
        }
    }

    fn sample_entry(timeout_sec: i64) -> RelayEntry {
        let now = Utc::now();
        RelayEntry {
            chat_id: Some(42),
            task: "order coffee".into(),
            session_id: "s1".into(),
            step: 3,
            capability: "payment".into(),
            instruction: "Approve the purchase".into(),
            reason: String::new(),
            current_app: "com.coffee.app".into(),
            screenshot_path: None,
            timeout_sec: timeout_sec.max(0) as u64,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(timeout_sec),
            poll_token: "pt".into(),
            open_token: "ot".into(),
            status: "pending".into(),
            note: String::new(),
            decided_at: None,
            artifact: None,
        }
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.json");
        let mut store = RelayStore::open(path.clone());
        store.entries.insert("a".into(), sample_entry(300));
        store.persist();

        let reopened = RelayStore::open(path);
        assert_eq!(reopened.entries.len(), 1);
        assert_eq!(reopened.entries["a"].capability, "payment");
        assert_eq!(reopened.entries["a"].status, "pending");
    }

    #[test]
    fn test_refresh_expiry_flips_to_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RelayStore::open(dir.path().join("requests.json"));
        store.entries.insert("a".into(), sample_entry(-5));
        store.refresh_expiry("a");
        assert_eq!(store.entries["a"].status, "timeout");
        assert!(store.entries["a"].decided_at.is_some());
    }

    #[test]
    fn test_decode_form() {
        let fields = decode_form(b"approved=true&note=looks+fine%21");
        assert_eq!(fields["approved"], "true");
        assert_eq!(fields["note"], "looks fine!");
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }

    #[tokio::test]
    async fn test_create_poll_resolve_flow() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "");
        let router = build_router(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);

        // Create.
        let created: serde_json::Value = client
            .post(format!("{}/v1/human-auth/requests", base))
            .json(&serde_json::json!({
                "requestId": "req-1",
                "chatId": 7,
                "task": "order coffee",
                "sessionId": "s1",
                "step": 2,
                "capability": "payment",
                "instruction": "Approve the charge",
                "timeoutSec": 120
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["requestId"], "req-1");
        let poll_token = created["pollToken"].as_str().unwrap().to_string();
        assert!(created["openUrl"]
            .as_str()
            .unwrap()
            .starts_with("https://relay.example.com/human-auth/req-1?token="));

        // Poll: pending.
        let polled: serde_json::Value = client
            .get(format!(
                "{}/v1/human-auth/requests/req-1?pollToken={}",
                base, poll_token
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(polled["status"], "pending");

        // Resolve.
        let resolved = client
            .post(format!("{}/v1/human-auth/requests/req-1/resolve", base))
            .json(&serde_json::json!({"approved": true, "note": "go ahead"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resolved.status(), 200);

        // Second resolve conflicts.
        let again = client
            .post(format!("{}/v1/human-auth/requests/req-1/resolve", base))
            .json(&serde_json::json!({"approved": false}))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 409);

        // Poll reflects the decision.
        let polled: serde_json::Value = client
            .get(format!(
                "{}/v1/human-auth/requests/req-1?pollToken={}",
                base, poll_token
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(polled["status"], "approved");
        assert_eq!(polled["note"], "go ahead");

        // Unknown id.
        let missing = client
            .get(format!("{}/v1/human-auth/requests/nope?pollToken=x", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_bearer_required_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "secret-key");
        let router = build_router(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);
        let body = serde_json::json!({
            "task": "t", "sessionId": "s", "step": 1,
            "capability": "c", "instruction": "i", "timeoutSec": 60
        });

        let denied = client
            .post(format!("{}/v1/human-auth/requests", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);

        let allowed = client
            .post(format!("{}/v1/human-auth/requests", base))
            .header("Authorization", "Bearer secret-key")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);
    }
}
