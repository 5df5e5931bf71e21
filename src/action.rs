use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One UI action planned by the model. Every external boundary (model
/// output, script persistence) goes through [`Action::normalize`], so the
/// rest of the runtime only ever sees well-formed variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Tap {
        x: i64,
        y: i64,
    },
    #[serde(rename_all = "camelCase")]
    Swipe {
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        duration_ms: u64,
    },
    #[serde(rename = "type")]
    Type {
        text: String,
    },
    Keyevent {
        keycode: String,
    },
    #[serde(rename_all = "camelCase")]
    LaunchApp {
        package_name: String,
    },
    Shell {
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    RunScript {
        script: String,
        timeout_sec: u64,
    },
    #[serde(rename_all = "camelCase")]
    RequestHumanAuth {
        capability: String,
        instruction: String,
        timeout_sec: u64,
    },
    #[serde(rename_all = "camelCase")]
    Wait {
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },
    Finish {
        message: String,
    },
}

impl Action {
    /// Canonical normalization: every missing or invalid field gets a
    /// fixed default; an unknown or absent type becomes `wait(1000)`.
    pub fn normalize(value: &Value) -> Action {
        let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match kind {
            "tap" => Action::Tap {
                x: int_field(value, "x", 0),
                y: int_field(value, "y", 0),
            },
            "swipe" => Action::Swipe {
                x1: int_field(value, "x1", 0),
                y1: int_field(value, "y1", 0),
                x2: int_field(value, "x2", 0),
                y2: int_field(value, "y2", 0),
                duration_ms: uint_field(value, &["durationMs", "duration_ms"], 300),
            },
            "type" => Action::Type {
                text: str_field(value, &["text"], ""),
            },
            "keyevent" => Action::Keyevent {
                keycode: str_field(value, &["keycode", "code", "key"], "KEYCODE_ENTER"),
            },
            "launch_app" => Action::LaunchApp {
                package_name: str_field(value, &["packageName", "package_name", "package"], ""),
            },
            "shell" => Action::Shell {
                command: str_field(value, &["command"], ""),
            },
            "run_script" => Action::RunScript {
                script: str_field(value, &["script"], ""),
                timeout_sec: uint_field(value, &["timeoutSec", "timeout_sec"], 60),
            },
            "request_human_auth" => Action::RequestHumanAuth {
                capability: str_field(value, &["capability"], "unknown"),
                instruction: str_field(
                    value,
                    &["instruction"],
                    "Please approve this step on your phone or via /auth.",
                ),
                timeout_sec: uint_field(value, &["timeoutSec", "timeout_sec"], 300),
            },
            "wait" => Action::Wait {
                duration_ms: uint_field(value, &["durationMs", "duration_ms"], 1000),
                reason: str_field(value, &["reason"], ""),
            },
            "finish" => Action::Finish {
                message: str_field(value, &["message"], "Task finished."),
            },
            _ => Action::Wait {
                duration_ms: 1000,
                reason: String::new(),
            },
        }
    }

    /// The canonical wait substituted when model output cannot be parsed.
    pub fn invalid_model_output() -> Action {
        Action::Wait {
            duration_ms: 1000,
            reason: "model output was not valid".into(),
        }
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::Swipe { .. } => "swipe",
            Action::Type { .. } => "type",
            Action::Keyevent { .. } => "keyevent",
            Action::LaunchApp { .. } => "launch_app",
            Action::Shell { .. } => "shell",
            Action::RunScript { .. } => "run_script",
            Action::RequestHumanAuth { .. } => "request_human_auth",
            Action::Wait { .. } => "wait",
            Action::Finish { .. } => "finish",
        }
    }

    /// Multiply positional fields by the inverse scale factors and clamp
    /// into `[0, width)` × `[0, height)`. Non-positional actions pass
    /// through untouched.
    pub fn rescaled(self, scale_x: f64, scale_y: f64, width: i64, height: i64) -> Action {
        let cx = |v: i64| ((v as f64 * scale_x).round() as i64).clamp(0, width.max(1) - 1);
        let cy = |v: i64| ((v as f64 * scale_y).round() as i64).clamp(0, height.max(1) - 1);
        match self {
            Action::Tap { x, y } => Action::Tap { x: cx(x), y: cy(y) },
            Action::Swipe { x1, y1, x2, y2, duration_ms } => Action::Swipe {
                x1: cx(x1),
                y1: cy(y1),
                x2: cx(x2),
                y2: cy(y2),
                duration_ms,
            },
            other => other,
        }
    }

    /// Low-precision spatial fingerprint used by the anti-loop ring.
    pub fn coarse_target(&self) -> String {
        match self {
            Action::Tap { x, y } => format!("{},{}", x >> 5, y >> 5),
            Action::LaunchApp { package_name } => package_name.clone(),
            Action::Keyevent { keycode } => keycode.clone(),
            _ => String::new(),
        }
    }

    /// Compact JSON for session logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

fn int_field(value: &Value, key: &str, default: i64) -> i64 {
    value
        .get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)))
        .unwrap_or(default)
}

fn uint_field(value: &Value, keys: &[&str], default: u64) -> u64 {
    for key in keys {
        if let Some(v) = value.get(key) {
            if let Some(n) = v.as_u64() {
                return n;
            }
            if let Some(f) = v.as_f64() {
                if f >= 0.0 {
                    return f.round() as u64;
                }
            }
        }
    }
    default
}

fn str_field(value: &Value, keys: &[&str], default: &str) -> String {
    for key in keys {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_tap_defaults() {
        let a = Action::normalize(&json!({"type": "tap"}));
        assert_eq!(a, Action::Tap { x: 0, y: 0 });
    }

    #[test]
    fn test_normalize_swipe_defaults() {
        let a = Action::normalize(&json!({"type": "swipe", "x1": 100, "y1": 200}));
        assert_eq!(
            a,
            Action::Swipe { x1: 100, y1: 200, x2: 0, y2: 0, duration_ms: 300 }
        );
    }

    #[test]
    fn test_normalize_accepts_float_coords() {
        let a = Action::normalize(&json!({"type": "tap", "x": 12.7, "y": 9.2}));
        assert_eq!(a, Action::Tap { x: 13, y: 9 });
    }

    #[test]
    fn test_normalize_keyevent_default() {
        let a = Action::normalize(&json!({"type": "keyevent"}));
        assert_eq!(a, Action::Keyevent { keycode: "KEYCODE_ENTER".into() });
    }

    #[test]
    fn test_normalize_unknown_type_becomes_wait() {
        let a = Action::normalize(&json!({"type": "levitate"}));
        assert_eq!(a, Action::Wait { duration_ms: 1000, reason: String::new() });
        let b = Action::normalize(&json!({"x": 4}));
        assert_eq!(b, Action::Wait { duration_ms: 1000, reason: String::new() });
    }

    #[test]
    fn test_normalize_run_script_defaults() {
        let a = Action::normalize(&json!({"type": "run_script", "script": "echo hi"}));
        assert_eq!(a, Action::RunScript { script: "echo hi".into(), timeout_sec: 60 });
    }

    #[test]
    fn test_normalize_auth_defaults() {
        let a = Action::normalize(&json!({"type": "request_human_auth"}));
        match a {
            Action::RequestHumanAuth { capability, timeout_sec, .. } => {
                assert_eq!(capability, "unknown");
                assert_eq!(timeout_sec, 300);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_normalize_finish_default_message() {
        let a = Action::normalize(&json!({"type": "finish"}));
        assert_eq!(a, Action::Finish { message: "Task finished.".into() });
    }

    #[test]
    fn test_rescale_clamps_to_device_bounds() {
        // Tap at (2000, 50) on a 1080x1920 device with identity scale.
        let a = Action::Tap { x: 2000, y: 50 }.rescaled(1.0, 1.0, 1080, 1920);
        assert_eq!(a, Action::Tap { x: 1079, y: 50 });
    }

    #[test]
    fn test_rescale_applies_inverse_factors() {
        let a = Action::Tap { x: 384, y: 512 }.rescaled(1.5, 1.5, 1080, 1920);
        assert_eq!(a, Action::Tap { x: 576, y: 768 });
        let s = Action::Swipe { x1: 0, y1: 0, x2: 100, y2: 100, duration_ms: 250 }
            .rescaled(2.0, 2.0, 1080, 1920);
        assert_eq!(
            s,
            Action::Swipe { x1: 0, y1: 0, x2: 200, y2: 200, duration_ms: 250 }
        );
    }

    #[test]
    fn test_coarse_target() {
        assert_eq!(Action::Tap { x: 64, y: 96 }.coarse_target(), "2,3");
        assert_eq!(
            Action::LaunchApp { package_name: "com.x".into() }.coarse_target(),
            "com.x"
        );
        assert_eq!(Action::Type { text: "hi".into() }.coarse_target(), "");
    }

    #[test]
    fn test_serde_tag_round_trip() {
        let a = Action::Type { text: "hello".into() };
        let s = a.to_json();
        assert!(s.contains("\"type\":\"type\""));
        let back: Action = serde_json::from_str(&s).unwrap();
        assert_eq!(back, a);
    }
}
