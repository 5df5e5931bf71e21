use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Ring capacity consumed by the dashboard.
const CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogCategory {
    Gateway,
    Cron,
    Heartbeat,
    HumanAuth,
    Warn,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Gateway => "gateway",
            LogCategory::Cron => "cron",
            LogCategory::Heartbeat => "heartbeat",
            LogCategory::HumanAuth => "human-auth",
            LogCategory::Warn => "warn",
            LogCategory::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub category: LogCategory,
    pub line: String,
}

/// Every gateway log line goes to stdout (via tracing) and into this
/// bounded ring, which the dashboard reads.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<LogLine>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self { lines: Mutex::new(VecDeque::with_capacity(256)) }
    }

    pub fn push(&self, category: LogCategory, line: impl Into<String>) {
        let line = line.into();
        match category {
            LogCategory::Warn => warn!("{}", line),
            LogCategory::Error => error!("{}", line),
            other => info!("[{}] {}", other.as_str(), line),
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() >= CAPACITY {
            lines.pop_front();
        }
        lines.push_back(LogLine { at: Utc::now(), category, line });
    }

    pub fn snapshot(&self, limit: usize) -> Vec<LogLine> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        let start = lines.len().saturating_sub(limit);
        lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_caps_at_capacity() {
        let buf = LogBuffer::new();
        for i in 0..(CAPACITY + 50) {
            buf.push(LogCategory::Gateway, format!("line {}", i));
        }
        assert_eq!(buf.len(), CAPACITY);
        let tail = buf.snapshot(1);
        assert_eq!(tail[0].line, format!("line {}", CAPACITY + 49));
    }

    #[test]
    fn test_snapshot_limit() {
        let buf = LogBuffer::new();
        for i in 0..10 {
            buf.push(LogCategory::Cron, format!("tick {}", i));
        }
        let tail = buf.snapshot(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "tick 7");
        assert_eq!(tail[2].line, "tick 9");
    }
}
