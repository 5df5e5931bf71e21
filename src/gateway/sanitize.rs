use regex::Regex;
use std::sync::OnceLock;

/// Telegram's hard cap on one message.
const MESSAGE_LIMIT: usize = 4096;

/// Line prefixes that never leave the process: internal bookkeeping the
/// agent writes into result messages.
const STRIP_PREFIXES: &[&str] = &["Session:", "Auto skill:", "Auto script:"];

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Absolute filesystem paths with at least two components, not
    // preceded by a URL scheme's "//".
    RE.get_or_init(|| Regex::new(r"(^|[\s('\x22=])(/(?:[\w@.-]+/)+[\w@.-]+)").unwrap())
}

/// Scrub one outbound chat message: drop internal lines, redact absolute
/// local paths, collapse whitespace, and truncate to the provider limit.
pub fn sanitize_outbound(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if STRIP_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        let redacted = path_regex().replace_all(line, "$1[local path]");
        // Collapse runs of spaces and tabs.
        let collapsed = redacted
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        kept.push(collapsed);
    }

    // Collapse blank-line runs.
    let mut out = String::new();
    let mut last_blank = false;
    for line in kept {
        let blank = line.is_empty();
        if blank && last_blank {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
        last_blank = blank;
    }
    let out = out.trim().to_string();

    if out.chars().count() > MESSAGE_LIMIT {
        let cut: String = out.chars().take(MESSAGE_LIMIT - 1).collect();
        format!("{}…", cut)
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_internal_lines() {
        let text = "Done!\nSession: /home/u/.openpocket/workspace/sessions/x.md\nAuto skill: timer\nAll set.";
        let out = sanitize_outbound(text);
        assert!(!out.contains("Session:"));
        assert!(!out.contains("Auto skill:"));
        assert!(out.contains("Done!"));
        assert!(out.contains("All set."));
    }

    #[test]
    fn test_redacts_absolute_paths() {
        let text = "Saved to /home/u/.openpocket/state/screenshots/s1/step-3.png for you";
        let out = sanitize_outbound(text);
        assert!(!out.contains("/home/u"));
        assert!(!out.contains("state/screenshots"));
        assert!(out.contains("[local path]"));
    }

    #[test]
    fn test_keeps_urls() {
        let text = "Open https://relay.example.com/human-auth/abc?token=x to approve";
        let out = sanitize_outbound(text);
        assert!(out.contains("https://relay.example.com/human-auth/abc?token=x"));
    }

    #[test]
    fn test_collapses_whitespace() {
        let text = "a    b\n\n\n\nc\t\td";
        let out = sanitize_outbound(text);
        assert_eq!(out, "a b\n\nc d");
    }

    #[test]
    fn test_truncates_to_limit() {
        let text = "x".repeat(6000);
        let out = sanitize_outbound(&text);
        assert_eq!(out.chars().count(), MESSAGE_LIMIT);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn test_workspace_paths_never_survive() {
        let text = "Result at /Users/sam/.openpocket/workspace/sessions/20250101-120000-ab.md ok";
        let out = sanitize_outbound(text);
        for line in out.lines() {
            assert!(!line.contains("workspace/"));
            assert!(!line.starts_with("Session:"));
        }
    }
}
