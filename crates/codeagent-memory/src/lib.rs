use codeagent_core::{ChatMessage, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Prefix of the synthetic message that replaces the compressed middle of
/// the conversation.
pub const SUMMARY_MARKER: &str = "history summary:";

const ERROR_KEYWORDS: [&str; 3] = ["error", "fail", "exception"];
const COMPLETION_KEYWORDS: [&str; 2] = ["complete", "success"];

/// Conversational-memory compressor. Once the history holds
/// `compress_every` user turns, everything except the system messages and
/// the most recent `2 * keep_recent` non-system messages is folded into a
/// single extractive summary message.
pub struct ContextCompressor {
    compress_every: usize,
    keep_recent: usize,
    /// Diagnostic counter: user turns seen by the last
    /// `should_compress`/`compress` call.
    pub turn_count: usize,
    file_pattern: Regex,
    tool_pattern: Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_count: usize,
    pub compressed_count: usize,
    pub ratio: f64,
    pub saved_count: usize,
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(5, 3)
    }
}

impl ContextCompressor {
    pub fn new(compress_every: usize, keep_recent: usize) -> Self {
        Self {
            compress_every,
            keep_recent,
            turn_count: 0,
            // Marker word, optional quote (JSON keys), colon, then a
            // file-name-like token with an extension.
            file_pattern: Regex::new(
                r#"(?i)(?:path|file|read|create|edit)"?\s*:\s*"?([A-Za-z0-9_\-./]+\.[A-Za-z]+)"#,
            )
            .expect("static regex"),
            tool_pattern: Regex::new(r"executed tool\s+([A-Za-z0-9_]+)").expect("static regex"),
        }
    }

    /// True once the history holds at least `compress_every` user turns.
    pub fn should_compress(&mut self, history: &[ChatMessage]) -> bool {
        self.turn_count = history.iter().filter(|m| m.role == Role::User).count();
        self.turn_count >= self.compress_every
    }

    /// Produce the compressed history: system messages verbatim, then one
    /// summary message for the older middle (when there is one), then the
    /// most recent `2 * keep_recent` non-system messages verbatim. Pure
    /// function of its input apart from the turn counter.
    pub fn compress(&mut self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        if history.is_empty() {
            return Vec::new();
        }

        let system: Vec<ChatMessage> = history
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let non_system: Vec<ChatMessage> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        let tail_len = self.keep_recent * 2;
        let split = non_system.len().saturating_sub(tail_len);
        let (middle, recent) = non_system.split_at(split);

        let mut result = system;
        if !middle.is_empty() {
            let summary = self.summarize(middle);
            result.push(ChatMessage::user(format!("{SUMMARY_MARKER}\n{summary}")));
        }
        result.extend(recent.iter().cloned());

        self.turn_count = result.iter().filter(|m| m.role == Role::User).count();
        result
    }

    /// Extractive summary of a message slice: involved files, invoked
    /// tools, error lines, and completion lines, each as one labeled
    /// paragraph. Falls back to a generic one-liner when nothing matches.
    pub fn summarize(&self, messages: &[ChatMessage]) -> String {
        let mut paragraphs = Vec::new();

        let mut files = BTreeSet::new();
        for msg in messages {
            for capture in self.file_pattern.captures_iter(&msg.content) {
                if let Some(m) = capture.get(1) {
                    files.insert(m.as_str().to_string());
                }
            }
        }
        if !files.is_empty() {
            let joined = files.into_iter().collect::<Vec<_>>().join(", ");
            paragraphs.push(format!("files involved: {joined}"));
        }

        let mut tools = BTreeSet::new();
        for msg in messages {
            for capture in self.tool_pattern.captures_iter(&msg.content) {
                if let Some(m) = capture.get(1) {
                    tools.insert(m.as_str().to_string());
                }
            }
        }
        if !tools.is_empty() {
            let joined = tools.into_iter().collect::<Vec<_>>().join(", ");
            paragraphs.push(format!("tools used: {joined}"));
        }

        let errors = collect_keyword_lines(messages, &ERROR_KEYWORDS);
        if !errors.is_empty() {
            paragraphs.push(format!("errors encountered:\n{}", errors.join("\n")));
        }

        let completed = collect_keyword_lines(messages, &COMPLETION_KEYWORDS);
        if !completed.is_empty() {
            paragraphs.push(format!("operations completed:\n{}", completed.join("\n")));
        }

        if paragraphs.is_empty() {
            return format!(
                "{} turns exchanged, discussing a code-related task.",
                messages.len()
            );
        }
        paragraphs.join("\n\n")
    }

    pub fn stats(&self, original: &[ChatMessage], compressed: &[ChatMessage]) -> CompressionStats {
        let original_count = original.len();
        let compressed_count = compressed.len();
        let ratio = if original_count > 0 {
            1.0 - compressed_count as f64 / original_count as f64
        } else {
            0.0
        };
        CompressionStats {
            original_count,
            compressed_count,
            ratio,
            saved_count: original_count.saturating_sub(compressed_count),
        }
    }
}

/// Matching lines per message, capped at 2 per message.
fn collect_keyword_lines(messages: &[ChatMessage], keywords: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for msg in messages {
        let matching: Vec<&str> = msg
            .content
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                keywords.iter().any(|kw| lower.contains(kw))
            })
            .take(2)
            .collect();
        out.extend(matching.into_iter().map(str::to_string));
    }
    out
}
