use std::path::PathBuf;
use tracing::info;

use crate::adb::AdbClient;

/// Package of the bundled permission exercise app.
pub const TEST_APP_PACKAGE: &str = "com.openpocket.permissiontest";

/// One permission scenario the test app can present.
#[derive(Debug, Clone, Copy)]
pub struct PermissionCase {
    pub id: &'static str,
    pub name: &'static str,
    pub permission: &'static str,
    pub description: &'static str,
}

pub const CASES: &[PermissionCase] = &[
    PermissionCase {
        id: "camera",
        name: "Camera prompt",
        permission: "android.permission.CAMERA",
        description: "Opens a screen that requests the camera permission.",
    },
    PermissionCase {
        id: "microphone",
        name: "Microphone prompt",
        permission: "android.permission.RECORD_AUDIO",
        description: "Opens a screen that requests the microphone permission.",
    },
    PermissionCase {
        id: "location",
        name: "Location prompt",
        permission: "android.permission.ACCESS_FINE_LOCATION",
        description: "Opens a screen that requests precise location.",
    },
    PermissionCase {
        id: "contacts",
        name: "Contacts prompt",
        permission: "android.permission.READ_CONTACTS",
        description: "Opens a screen that requests contact access.",
    },
    PermissionCase {
        id: "notifications",
        name: "Notification prompt",
        permission: "android.permission.POST_NOTIFICATIONS",
        description: "Opens a screen that requests notification permission.",
    },
];

pub fn find_case(id: &str) -> Option<&'static PermissionCase> {
    CASES.iter().find(|c| c.id == id)
}

/// The task text submitted by `test permission-app run`; exercised end to
/// end it walks the agent through a permission dialog and a human-auth
/// escalation.
pub fn canonical_task(case: Option<&PermissionCase>) -> String {
    match case {
        Some(case) => format!(
            "Open the Permission Test app, start the '{}' case, and handle the \
             system permission dialog that appears.",
            case.name
        ),
        None => "Open the Permission Test app, run through each permission case, \
                 and handle every system permission dialog that appears."
            .to_string(),
    }
}

/// Locations probed for the prebuilt test APK.
fn apk_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var("OPENPOCKET_TEMPLATE_DIR") {
        if !dir.is_empty() {
            candidates.push(PathBuf::from(dir).join("permission-app.apk"));
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            candidates.push(parent.join("demos").join("permission-app.apk"));
        }
    }
    candidates.push(PathBuf::from("demos/permission-app/permission-app.apk"));
    candidates
}

pub fn locate_apk() -> Option<PathBuf> {
    apk_candidates().into_iter().find(|p| p.exists())
}

/// Drives the test app over adb.
pub struct TestAppDriver {
    adb: AdbClient,
    device: String,
}

impl TestAppDriver {
    pub async fn connect(adb: AdbClient, device: Option<&str>) -> anyhow::Result<Self> {
        let device = adb.select_device(device).await?;
        Ok(Self { adb, device })
    }

    /// Install the prebuilt APK; with `clean`, uninstall first.
    pub async fn deploy(&self, clean: bool) -> anyhow::Result<String> {
        if clean {
            let _ = self.uninstall().await;
        }
        self.install().await
    }

    pub async fn install(&self) -> anyhow::Result<String> {
        let Some(apk) = locate_apk() else {
            anyhow::bail!(
                "permission-app.apk not found; checked {:?}",
                apk_candidates()
            );
        };
        let apk_str = apk.to_string_lossy().into_owned();
        self.adb
            .run(Some(&self.device), &["install", "-r", &apk_str])
            .await?;
        info!("test app installed from {}", apk_str);
        Ok(format!("Installed {} on {}", TEST_APP_PACKAGE, self.device))
    }

    pub async fn launch(&self, case: Option<&PermissionCase>) -> anyhow::Result<String> {
        match case {
            Some(case) => {
                // The app exposes one activity per case via an intent extra.
                let extra = format!("--es case {}", case.id);
                let component = format!("{}/.MainActivity", TEST_APP_PACKAGE);
                let cmd = format!("am start -n {} {}", component, extra);
                self.adb.shell(&self.device, &cmd).await?;
                Ok(format!("Launched case '{}'", case.id))
            }
            None => {
                self.adb.launch_app(&self.device, TEST_APP_PACKAGE).await?;
                Ok(format!("Launched {}", TEST_APP_PACKAGE))
            }
        }
    }

    /// Clear app data so every permission prompt fires again.
    pub async fn reset(&self) -> anyhow::Result<String> {
        self.adb
            .shell(&self.device, &format!("pm clear {}", TEST_APP_PACKAGE))
            .await?;
        Ok(format!("Cleared data for {}", TEST_APP_PACKAGE))
    }

    pub async fn uninstall(&self) -> anyhow::Result<String> {
        self.adb
            .shell(&self.device, &format!("pm uninstall {}", TEST_APP_PACKAGE))
            .await?;
        Ok(format!("Uninstalled {}", TEST_APP_PACKAGE))
    }
}

pub fn cases_text() -> String {
    let mut out = String::from("Permission cases:\n");
    for case in CASES {
        out.push_str(&format!(
            "  {} — {} ({}): {}\n",
            case.id, case.name, case.permission, case.description
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_lookup() {
        assert_eq!(find_case("camera").unwrap().name, "Camera prompt");
        assert!(find_case("x-ray").is_none());
    }

    #[test]
    fn test_canonical_task_mentions_case() {
        let task = canonical_task(find_case("location"));
        assert!(task.contains("Location prompt"));
        let all = canonical_task(None);
        assert!(all.contains("each permission case"));
    }

    #[test]
    fn test_cases_text_lists_all() {
        let text = cases_text();
        for case in CASES {
            assert!(text.contains(case.id));
        }
    }
}
