use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::adb::AdbClient;
use crate::emulator::EmulatorManager;
use crate::logbuf::LogBuffer;

/// Snapshot callback supplied by the gateway in integrated mode.
pub type GatewayStatusFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
pub struct DashboardState {
    pub adb: AdbClient,
    pub emulator: EmulatorManager,
    /// Present when running inside the gateway process.
    pub gateway_status: Option<GatewayStatusFn>,
    pub log: Option<Arc<LogBuffer>>,
}

pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/runtime", get(runtime))
        .route("/api/emulator/start", post(emulator_start))
        .route("/api/emulator/stop", post(emulator_stop))
        .route("/api/emulator/show", post(emulator_show))
        .route("/api/emulator/hide", post(emulator_hide))
        .route("/api/emulator/tap", post(emulator_tap))
        .route("/api/emulator/type", post(emulator_type))
        .route("/api/emulator/preview", get(emulator_preview))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(host: &str, port: u16, state: DashboardState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dashboard API listening on {}", addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

fn err_response(e: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": {"code": "internal", "message": e.to_string()}})),
    )
        .into_response()
}

/// Read-only runtime snapshot: gateway status (callback in integrated
/// mode, process scan in standalone mode), emulator status, recent logs.
async fn runtime(State(state): State<DashboardState>) -> Response {
    let gateway = match &state.gateway_status {
        Some(f) => f(),
        None => serde_json::json!({
            "mode": "standalone",
            "siblingGatewayRunning": detect_sibling_gateway(),
        }),
    };
    let emulator = match state.emulator.status().await {
        Ok(s) => serde_json::to_value(&s).unwrap_or_default(),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };
    let logs: Vec<_> = state
        .log
        .as_ref()
        .map(|l| l.snapshot(200))
        .unwrap_or_default();
    Json(serde_json::json!({
        "gateway": gateway,
        "emulator": emulator,
        "logs": logs,
    }))
    .into_response()
}

async fn emulator_start(State(state): State<DashboardState>) -> Response {
    match state.emulator.start(false).await {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

async fn emulator_stop(State(state): State<DashboardState>) -> Response {
    match state.emulator.stop().await {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

async fn emulator_show(State(state): State<DashboardState>) -> Response {
    match state.emulator.show_window().await {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

async fn emulator_hide(State(state): State<DashboardState>) -> Response {
    match state.emulator.hide_window().await {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct TapBody {
    x: i64,
    y: i64,
}

async fn emulator_tap(State(state): State<DashboardState>, Json(body): Json<TapBody>) -> Response {
    let result = async {
        let device = state.adb.select_device(None).await?;
        state.adb.tap(&device, body.x, body.y).await
    }
    .await;
    match result {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct TypeBody {
    text: String,
}

async fn emulator_type(
    State(state): State<DashboardState>,
    Json(body): Json<TypeBody>,
) -> Response {
    let result = async {
        let device = state.adb.select_device(None).await?;
        state.adb.type_text(&device, &body.text).await
    }
    .await;
    match result {
        Ok(msg) => Json(serde_json::json!({"ok": true, "message": msg})).into_response(),
        Err(e) => err_response(e),
    }
}

/// Fresh screenshot as base64 PNG.
async fn emulator_preview(State(state): State<DashboardState>) -> Response {
    let result = async {
        let device = state.adb.select_device(None).await?;
        state.adb.capture_screenshot(&device).await
    }
    .await;
    match result {
        Ok(png) => Json(serde_json::json!({
            "mimeType": "image/png",
            "base64": base64::engine::general_purpose::STANDARD.encode(png),
        }))
        .into_response(),
        Err(e) => err_response(e),
    }
}

/// Standalone mode: look for a sibling gateway in the process table.
fn detect_sibling_gateway() -> bool {
    let Ok(out) = std::process::Command::new("ps")
        .args(["-eo", "pid,command"])
        .output()
    else {
        return false;
    };
    let listing = String::from_utf8_lossy(&out.stdout);
    let me = std::process::id().to_string();
    listing.lines().any(|line| {
        line.contains("openpocket")
            && line.contains("gateway")
            && !line.trim_start().starts_with(&me)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;

    #[tokio::test]
    async fn test_runtime_endpoint_standalone() {
        let adb = AdbClient::new(None);
        let state = DashboardState {
            adb: adb.clone(),
            emulator: EmulatorManager::new(EmulatorConfig::default(), adb),
            gateway_status: None,
            log: Some(Arc::new(LogBuffer::new())),
        };
        let router = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("http://{}/api/runtime", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["gateway"]["mode"], "standalone");
        assert!(body.get("logs").is_some());
    }

    #[tokio::test]
    async fn test_runtime_endpoint_integrated_callback() {
        let adb = AdbClient::new(None);
        let state = DashboardState {
            adb: adb.clone(),
            emulator: EmulatorManager::new(EmulatorConfig::default(), adb),
            gateway_status: Some(Arc::new(|| serde_json::json!({"running": true, "tasks": 2}))),
            log: None,
        };
        let router = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("http://{}/api/runtime", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["gateway"]["running"], true);
        assert_eq!(body["gateway"]["tasks"], 2);
    }
}
