use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{ErrorKind, TaskError};
use crate::scaler::{self, ScaleTarget};

/// Hard deadline on any single adb invocation.
const ADB_TIMEOUT: Duration = Duration::from_secs(30);

/// stderr attached to failures is bounded so chat replies and session
/// files stay readable.
const MAX_STDERR_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub state: String,
}

impl DeviceInfo {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// One screen observation: foreground app, device and scaled geometry, and
/// the PNG handed to the model. Lives only within a step iteration.
#[derive(Debug, Clone)]
pub struct ScreenSnapshot {
    pub device_id: String,
    pub current_app: String,
    pub width_device: u32,
    pub height_device: u32,
    pub width_scaled: u32,
    pub height_scaled: u32,
    pub scale_x: f64,
    pub scale_y: f64,
    pub captured_at: DateTime<Utc>,
    pub png: Vec<u8>,
}

/// Thin async wrapper over the adb binary with device selection and
/// per-device serialization: adb multiplexes badly when two commands hit
/// the same transport, so every invocation holds that device's lock for
/// the duration of the subprocess.
#[derive(Debug, Clone)]
pub struct AdbClient {
    /// Config-pinned device id; empty = auto-select.
    pinned: Option<String>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AdbClient {
    pub fn new(pinned: Option<String>) -> Self {
        Self {
            pinned: pinned.filter(|p| !p.is_empty()),
            locks: Arc::new(DashMap::new()),
        }
    }

    fn device_lock(&self, device: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(device.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn raw(&self, device: Option<&str>, args: &[&str]) -> anyhow::Result<std::process::Output> {
        let mut cmd = Command::new("adb");
        if let Some(dev) = device {
            cmd.args(["-s", dev]);
        }
        cmd.args(args);
        cmd.kill_on_drop(true);

        let guard = match device {
            Some(dev) => Some(self.device_lock(dev)),
            None => None,
        };
        let _held = match &guard {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let out = tokio::time::timeout(ADB_TIMEOUT, cmd.output())
            .await
            .map_err(|_| TaskError::new(ErrorKind::AdbFailed, "adb timed out after 30s"))??;
        Ok(out)
    }

    /// Run adb, return trimmed stdout. Failures carry a bounded stderr
    /// snippet.
    pub async fn run(&self, device: Option<&str>, args: &[&str]) -> anyhow::Result<String> {
        let out = self.raw(device, args).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            let stderr = bounded_stderr(&out.stderr);
            Err(TaskError::new(
                ErrorKind::AdbFailed,
                format!("adb {} failed: {}", args.first().unwrap_or(&""), stderr),
            )
            .into())
        }
    }

    pub async fn run_bytes(&self, device: Option<&str>, args: &[&str]) -> anyhow::Result<Vec<u8>> {
        let out = self.raw(device, args).await?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            let stderr = bounded_stderr(&out.stderr);
            Err(TaskError::new(
                ErrorKind::AdbFailed,
                format!("adb {} failed: {}", args.first().unwrap_or(&""), stderr),
            )
            .into())
        }
    }

    // ── Device discovery & selection ────────────────────────────────────

    pub async fn devices(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        let raw = self.run(None, &["devices"]).await?;
        Ok(parse_devices_output(&raw))
    }

    /// A device is booted when its boot-completion property reads truthy.
    pub async fn is_booted(&self, device: &str) -> bool {
        match self
            .run(Some(device), &["shell", "getprop", "sys.boot_completed"])
            .await
        {
            Ok(v) => v.trim() == "1",
            Err(_) => false,
        }
    }

    pub async fn booted_devices(&self) -> anyhow::Result<Vec<String>> {
        let mut booted = Vec::new();
        for dev in self.devices().await? {
            if dev.is_online() && self.is_booted(&dev.id).await {
                booted.push(dev.id);
            }
        }
        Ok(booted)
    }

    /// Selection order: explicit id > config-pinned > first booted >
    /// first online. No candidate = `device_unavailable`.
    pub async fn select_device(&self, explicit: Option<&str>) -> anyhow::Result<String> {
        let devices = self.devices().await?;
        if let Some(id) = explicit.filter(|s| !s.is_empty()) {
            if devices.iter().any(|d| d.id == id && d.is_online()) {
                return Ok(id.to_string());
            }
            return Err(TaskError::new(
                ErrorKind::DeviceUnavailable,
                format!("no_device: requested device '{}' is not online", id),
            )
            .into());
        }
        if let Some(pinned) = &self.pinned {
            if devices.iter().any(|d| &d.id == pinned && d.is_online()) {
                return Ok(pinned.clone());
            }
        }
        for dev in devices.iter().filter(|d| d.is_online()) {
            if self.is_booted(&dev.id).await {
                return Ok(dev.id.clone());
            }
        }
        if let Some(first) = devices.iter().find(|d| d.is_online()) {
            return Ok(first.id.clone());
        }
        Err(TaskError::new(ErrorKind::DeviceUnavailable, "no_device: no online device").into())
    }

    // ── Input primitives ────────────────────────────────────────────────

    pub async fn tap(&self, device: &str, x: i64, y: i64) -> anyhow::Result<String> {
        self.run(
            Some(device),
            &["shell", "input", "tap", &x.to_string(), &y.to_string()],
        )
        .await?;
        Ok(format!("Tapped ({}, {})", x, y))
    }

    pub async fn swipe(
        &self,
        device: &str,
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        duration_ms: u64,
    ) -> anyhow::Result<String> {
        self.run(
            Some(device),
            &[
                "shell",
                "input",
                "swipe",
                &x1.to_string(),
                &y1.to_string(),
                &x2.to_string(),
                &y2.to_string(),
                &duration_ms.to_string(),
            ],
        )
        .await?;
        Ok(format!(
            "Swiped ({}, {}) -> ({}, {}) over {}ms",
            x1, y1, x2, y2, duration_ms
        ))
    }

    pub async fn keyevent(&self, device: &str, keycode: &str) -> anyhow::Result<String> {
        self.run(Some(device), &["shell", "input", "keyevent", keycode])
            .await?;
        Ok(format!("Sent keyevent {}", keycode))
    }

    pub async fn launch_app(&self, device: &str, package: &str) -> anyhow::Result<String> {
        self.run(
            Some(device),
            &[
                "shell", "monkey", "-p", package, "-c",
                "android.intent.category.LAUNCHER", "1",
            ],
        )
        .await?;
        Ok(format!("Launched {}", package))
    }

    pub async fn shell(&self, device: &str, command: &str) -> anyhow::Result<String> {
        let out = self.run(Some(device), &["shell", command]).await?;
        Ok(if out.is_empty() { "ok".into() } else { out })
    }

    /// Unicode-safe text input. ASCII goes through `input text` with
    /// spaces encoded as `%s`; anything else (or an input failure) falls
    /// back to the clipboard + paste keyevent. The text is never handed to
    /// a shell for interpretation.
    pub async fn type_text(&self, device: &str, text: &str) -> anyhow::Result<String> {
        if text.is_empty() {
            return Ok("Typed nothing (empty text)".into());
        }
        if text.is_ascii() {
            let encoded = encode_input_text(text);
            match self
                .run(Some(device), &["shell", "input", "text", &encoded])
                .await
            {
                Ok(_) => return Ok(format!("Typed text length={}", text.chars().count())),
                Err(e) => {
                    warn!("input text failed ({}), falling back to clipboard", e);
                }
            }
        }
        self.run(Some(device), &["shell", "cmd", "clipboard", "set-text", text])
            .await?;
        self.keyevent(device, "KEYCODE_PASTE").await?;
        Ok(format!(
            "Typed text via clipboard paste length={}",
            text.chars().count()
        ))
    }

    // ── Observation ─────────────────────────────────────────────────────

    /// `exec-out screencap -p` — the returned bytes are a PNG.
    pub async fn capture_screenshot(&self, device: &str) -> anyhow::Result<Vec<u8>> {
        let bytes = self
            .run_bytes(Some(device), &["exec-out", "screencap", "-p"])
            .await?;
        if bytes.len() < 8 || &bytes[..8] != b"\x89PNG\r\n\x1a\n" {
            return Err(TaskError::new(
                ErrorKind::AdbFailed,
                format!("screencap returned {} bytes of non-PNG data", bytes.len()),
            )
            .into());
        }
        Ok(bytes)
    }

    pub async fn screen_size(&self, device: &str) -> anyhow::Result<(u32, u32)> {
        let raw = self.run(Some(device), &["shell", "wm", "size"]).await?;
        parse_physical_size(&raw).ok_or_else(|| {
            TaskError::new(ErrorKind::AdbFailed, format!("could not parse wm size: {}", raw))
                .into()
        })
    }

    pub async fn foreground_package(&self, device: &str) -> String {
        let raw = self
            .run(Some(device), &["shell", "dumpsys", "window", "windows"])
            .await
            .unwrap_or_default();
        extract_foreground_package(&raw).unwrap_or_else(|| "unknown".into())
    }

    /// Capture a full snapshot for one agent step: screenshot, physical
    /// size, foreground package, scaled image with inverse factors.
    pub async fn capture_screen_snapshot(
        &self,
        device: &str,
        claude_like: bool,
    ) -> anyhow::Result<ScreenSnapshot> {
        let png = self.capture_screenshot(device).await?;
        let (width, height) = self.screen_size(device).await?;
        let current_app = self.foreground_package(device).await;

        let scaled = scaler::scale_png(&png, ScaleTarget::for_model(claude_like))?;
        debug!(
            "snapshot {}x{} -> {}x{} app={}",
            width, height, scaled.width_scaled, scaled.height_scaled, current_app
        );

        Ok(ScreenSnapshot {
            device_id: device.to_string(),
            current_app,
            width_device: width,
            height_device: height,
            width_scaled: scaled.width_scaled,
            height_scaled: scaled.height_scaled,
            scale_x: width as f64 / scaled.width_scaled as f64,
            scale_y: height as f64 / scaled.height_scaled as f64,
            captured_at: Utc::now(),
            png: scaled.png,
        })
    }
}

// ── Free helpers ────────────────────────────────────────────────────────────

fn bounded_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "unknown error".into();
    }
    let mut end = trimmed.len().min(MAX_STDERR_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// `input text` wants spaces as `%s` and shell-ish characters escaped.
fn encode_input_text(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(' ', "%s")
        .replace('&', "\\&")
        .replace('<', "\\<")
        .replace('>', "\\>")
        .replace('|', "\\|")
        .replace(';', "\\;")
        .replace('(', "\\(")
        .replace(')', "\\)")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}

fn parse_devices_output(raw: &str) -> Vec<DeviceInfo> {
    raw.lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            Some(DeviceInfo { id: id.to_string(), state: state.to_string() })
        })
        .collect()
}

fn parse_physical_size(raw: &str) -> Option<(u32, u32)> {
    // Override size (if present) wins over Physical size.
    for prefix in ["Override size:", "Physical size:"] {
        for line in raw.lines() {
            if let Some(rest) = line.trim().strip_prefix(prefix) {
                let dims: Vec<u32> = rest
                    .trim()
                    .splitn(2, 'x')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect();
                if dims.len() == 2 && dims[0] > 0 && dims[1] > 0 {
                    return Some((dims[0], dims[1]));
                }
            }
        }
    }
    None
}

fn foreground_regexes() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"mCurrentFocus=Window\{\S+ \S+ ([A-Za-z0-9_.]+)/").unwrap(),
            Regex::new(r"mFocusedApp=.*?\s([A-Za-z0-9_.]+)/").unwrap(),
            Regex::new(r"mResumedActivity: ActivityRecord\{\S+ \S+ ([A-Za-z0-9_.]+)/").unwrap(),
        ]
    })
}

/// Extract the foreground package from a window dump. Three prioritized
/// patterns; the first match wins.
fn extract_foreground_package(raw: &str) -> Option<String> {
    for re in foreground_regexes() {
        if let Some(caps) = re.captures(raw) {
            return Some(caps[1].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_output() {
        let raw = "List of devices attached\nemulator-5554\tdevice\nemulator-5556\toffline\n\n";
        let devices = parse_devices_output(raw);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "emulator-5554");
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online());
    }

    #[test]
    fn test_parse_physical_size() {
        assert_eq!(parse_physical_size("Physical size: 1080x1920"), Some((1080, 1920)));
        assert_eq!(
            parse_physical_size("Physical size: 1080x1920\nOverride size: 720x1280"),
            Some((720, 1280))
        );
        assert_eq!(parse_physical_size("garbage"), None);
    }

    #[test]
    fn test_extract_foreground_package_current_focus() {
        let raw = "mCurrentFocus=Window{8a3f2c1 u0 com.android.settings/com.android.settings.Settings}";
        assert_eq!(
            extract_foreground_package(raw),
            Some("com.android.settings".into())
        );
    }

    #[test]
    fn test_extract_foreground_package_priority_order() {
        // mCurrentFocus wins even when mResumedActivity names another app.
        let raw = "mResumedActivity: ActivityRecord{abc u0 com.other.app/.Main t1}\n\
                   mCurrentFocus=Window{def u0 com.focused.app/.Activity}";
        assert_eq!(
            extract_foreground_package(raw),
            Some("com.focused.app".into())
        );
    }

    #[test]
    fn test_extract_foreground_package_resumed_fallback() {
        let raw = "mResumedActivity: ActivityRecord{abc u0 com.whatsapp/.HomeActivity t55}";
        assert_eq!(extract_foreground_package(raw), Some("com.whatsapp".into()));
        assert_eq!(extract_foreground_package("nothing here"), None);
    }

    #[test]
    fn test_encode_input_text() {
        assert_eq!(encode_input_text("hello world"), "hello%sworld");
        assert_eq!(encode_input_text("a&b"), "a\\&b");
        assert_eq!(encode_input_text("$(x)"), "\\$\\(x\\)");
    }

    #[test]
    fn test_bounded_stderr() {
        assert_eq!(bounded_stderr(b""), "unknown error");
        assert_eq!(bounded_stderr(b"  boom\n"), "boom");
        let long = vec![b'x'; 5000];
        assert_eq!(bounded_stderr(&long).len(), MAX_STDERR_BYTES);
    }
}
