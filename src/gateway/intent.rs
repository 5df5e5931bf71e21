/// Task-vs-chat heuristic for plain (non-command) messages.
///
/// The thresholds below are tunables, not invariants: nudge them when
/// the gateway misroutes real traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Drive the phone.
    Task,
    /// Small talk / questions; answered without starting an agent loop.
    Chat,
}

/// Imperative verbs that usually open a phone task.
const IMPERATIVE_VERBS: &[&str] = &[
    "open", "go", "send", "check", "turn", "install", "uninstall", "play",
    "set", "search", "take", "call", "text", "order", "buy", "download",
    "type", "tap", "swipe", "launch", "start", "stop", "enable", "disable",
    "find", "read", "reply", "post", "book", "navigate", "clear", "add",
    "remove", "schedule", "write", "compose", "share", "scroll", "mute",
    "unmute", "delete", "create", "record", "snap",
];

/// Minimum words for length to count toward the task score.
const MIN_TASK_WORDS: usize = 3;

/// Score at or above this classifies as a task.
const TASK_SCORE_THRESHOLD: i32 = 2;

pub fn classify(text: &str) -> Intent {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Intent::Chat;
    }
    let lower = trimmed.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    let mut score = 0i32;

    if let Some(first) = words.first() {
        let first = first.trim_matches(|c: char| !c.is_alphanumeric());
        if IMPERATIVE_VERBS.contains(&first) {
            score += 2;
        }
        // "please open ..." / "can you open ..."
        if (first == "please" || first == "can" || first == "could") && words.len() > 1 {
            let follow = words
                .iter()
                .skip(1)
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .find(|w| !matches!(*w, "you" | "please"));
            if follow.map(|w| IMPERATIVE_VERBS.contains(&w)).unwrap_or(false) {
                score += 2;
            }
        }
    }

    if words.len() >= MIN_TASK_WORDS {
        score += 1;
    }

    // Questions lean toward chat.
    if trimmed.ends_with('?') {
        score -= 2;
    }
    // Greetings are chat no matter the length.
    if matches!(
        words.first().copied(),
        Some("hi") | Some("hello") | Some("hey") | Some("thanks") | Some("thank")
    ) {
        score -= 2;
    }

    if score >= TASK_SCORE_THRESHOLD {
        Intent::Task
    } else {
        Intent::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obvious_tasks() {
        assert_eq!(classify("open the settings app"), Intent::Task);
        assert_eq!(classify("Send a message to Anna saying I'm late"), Intent::Task);
        assert_eq!(classify("turn on airplane mode"), Intent::Task);
        assert_eq!(classify("please open whatsapp and reply to the last chat"), Intent::Task);
    }

    #[test]
    fn test_obvious_chat() {
        assert_eq!(classify("hi"), Intent::Chat);
        assert_eq!(classify("hello there"), Intent::Chat);
        assert_eq!(classify("thanks!"), Intent::Chat);
        assert_eq!(classify("what's the weather like?"), Intent::Chat);
    }

    #[test]
    fn test_questions_lean_chat() {
        assert_eq!(classify("open apps often?"), Intent::Chat);
    }

    #[test]
    fn test_empty_is_chat() {
        assert_eq!(classify(""), Intent::Chat);
        assert_eq!(classify("   "), Intent::Chat);
    }
}
