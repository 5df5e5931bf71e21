use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::adb::AdbClient;
use crate::config::EmulatorConfig;
use crate::errors::{ErrorKind, TaskError};

/// Runtime status summary for the CLI, gateway `/status`, and dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmulatorStatus {
    pub avd_name: String,
    pub devices: Vec<String>,
    pub booted_devices: Vec<String>,
}

/// Manages the local emulator process through adb and the `emulator`
/// binary from the Android SDK.
#[derive(Debug, Clone)]
pub struct EmulatorManager {
    config: EmulatorConfig,
    adb: AdbClient,
}

impl EmulatorManager {
    pub fn new(config: EmulatorConfig, adb: AdbClient) -> Self {
        Self { config, adb }
    }

    fn emulator_binary() -> PathBuf {
        if let Ok(root) = std::env::var("ANDROID_SDK_ROOT") {
            let candidate = PathBuf::from(root).join("emulator").join("emulator");
            if candidate.exists() {
                return candidate;
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            let candidate = PathBuf::from(home)
                .join("Android")
                .join("Sdk")
                .join("emulator")
                .join("emulator");
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from("emulator")
    }

    pub async fn status(&self) -> anyhow::Result<EmulatorStatus> {
        let devices: Vec<String> = self
            .adb
            .devices()
            .await?
            .into_iter()
            .filter(|d| d.is_online())
            .map(|d| d.id)
            .collect();
        let booted = self.adb.booted_devices().await?;
        Ok(EmulatorStatus {
            avd_name: self.resolved_avd().await.unwrap_or_default(),
            devices,
            booted_devices: booted,
        })
    }

    pub async fn list_avds(&self) -> anyhow::Result<Vec<String>> {
        let out = Command::new(Self::emulator_binary())
            .arg("-list-avds")
            .output()
            .await?;
        if !out.status.success() {
            return Err(TaskError::new(
                ErrorKind::DeviceUnavailable,
                "emulator -list-avds failed; is the Android SDK installed?",
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && !l.starts_with("INFO"))
            .collect())
    }

    /// The configured AVD, or the first one the SDK knows about.
    async fn resolved_avd(&self) -> anyhow::Result<String> {
        if !self.config.avd_name.is_empty() {
            return Ok(self.config.avd_name.clone());
        }
        let avds = self.list_avds().await?;
        avds.into_iter().next().ok_or_else(|| {
            TaskError::new(ErrorKind::DeviceUnavailable, "no AVDs available").into()
        })
    }

    /// Start the emulator detached and (optionally) wait for boot
    /// completion. Idempotent: an already-booted device short-circuits.
    pub async fn start(&self, wait: bool) -> anyhow::Result<String> {
        let booted = self.adb.booted_devices().await.unwrap_or_default();
        if !booted.is_empty() {
            return Ok(format!("Emulator already running ({})", booted.join(", ")));
        }

        let avd = self.resolved_avd().await?;
        let mut cmd = Command::new(Self::emulator_binary());
        cmd.arg("-avd").arg(&avd);
        if self.config.headless {
            cmd.arg("-no-window");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn()?;
        // Detach: the emulator outlives the gateway process.
        drop(child);
        info!("emulator starting (avd={})", avd);

        if !wait {
            return Ok(format!("Emulator '{}' starting in background", avd));
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.boot_timeout_sec);
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let booted = self.adb.booted_devices().await.unwrap_or_default();
            if !booted.is_empty() {
                return Ok(format!(
                    "Emulator '{}' booted ({})",
                    avd,
                    booted.join(", ")
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TaskError::new(
                    ErrorKind::DeviceUnavailable,
                    format!(
                        "emulator '{}' did not boot within {}s",
                        avd, self.config.boot_timeout_sec
                    ),
                )
                .into());
            }
        }
    }

    pub async fn stop(&self) -> anyhow::Result<String> {
        let devices = self.adb.devices().await?;
        let emulators: Vec<_> = devices
            .iter()
            .filter(|d| d.id.starts_with("emulator-") && d.is_online())
            .collect();
        if emulators.is_empty() {
            return Ok("No emulator running".into());
        }
        for dev in &emulators {
            if let Err(e) = self.adb.run(Some(&dev.id), &["emu", "kill"]).await {
                warn!("emu kill failed for {}: {}", dev.id, e);
            }
        }
        Ok(format!(
            "Stopped {}",
            emulators
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Window visibility is a desktop concern: macOS gets osascript,
    /// Linux gets wmctrl when available.
    pub async fn hide_window(&self) -> anyhow::Result<String> {
        self.set_window_visible(false).await
    }

    pub async fn show_window(&self) -> anyhow::Result<String> {
        self.set_window_visible(true).await
    }

    async fn set_window_visible(&self, visible: bool) -> anyhow::Result<String> {
        if cfg!(target_os = "macos") {
            let verb = if visible { "true" } else { "false" };
            let script = format!(
                "tell application \"System Events\" to set visible of (every process whose name contains \"qemu\") to {}",
                verb
            );
            let out = Command::new("osascript").args(["-e", &script]).output().await?;
            if out.status.success() {
                return Ok(format!(
                    "Emulator window {}",
                    if visible { "shown" } else { "hidden" }
                ));
            }
            return Ok("Could not change emulator window visibility".into());
        }
        let action = if visible { "remove,hidden" } else { "add,hidden" };
        match Command::new("wmctrl")
            .args(["-r", "Android Emulator", "-b", action])
            .output()
            .await
        {
            Ok(out) if out.status.success() => Ok(format!(
                "Emulator window {}",
                if visible { "shown" } else { "hidden" }
            )),
            _ => Ok("Window control unavailable on this platform (install wmctrl)".into()),
        }
    }
}
