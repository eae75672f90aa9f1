//! Context-window eviction engine.
//!
//! Tracks every tool-call result produced in a run and rewrites the message
//! list before each model call, replacing old bulky results with one-line
//! summaries the model can recall by id.

use std::collections::{HashMap, HashSet};

use relay_llm::{Message, Role};
use serde_json::Value;
use tracing::debug;

use crate::config::{EvictionConfig, Summarizer};

/// Immutable bookkeeping for one tool call. Created on registration, never
/// mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: String,
    pub result_len: usize,
    pub summary: String,
    pub position: u64,
    pub round: u64,
    pub retention: u32,
}

/// Per-run registry of tool-call results, keyed by call id.
///
/// Rebuilt from persisted history at the start of every run so warm state
/// survives process restarts.
#[derive(Debug)]
pub struct ToolCallTracker {
    config: EvictionConfig,
    records: HashMap<String, ToolCallRecord>,
    next_position: u64,
    round: u64,
}

impl ToolCallTracker {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            next_position: 0,
            round: 0,
        }
    }

    /// Rebuilds tracker state from history: one model round per assistant
    /// message, one record per answered tool call.
    pub fn scan_messages(config: EvictionConfig, messages: &[Message]) -> Self {
        let mut tracker = Self::new(config);
        let mut calls: HashMap<String, (String, String)> = HashMap::new();

        for message in messages {
            match message.role {
                Role::Assistant => {
                    tracker.advance_round();
                    for call in &message.tool_calls {
                        calls.insert(call.id.clone(), (call.name.clone(), call.arguments.clone()));
                    }
                }
                Role::Tool => {
                    let Some(call_id) = message.tool_call_id.as_deref() else {
                        continue;
                    };
                    if let Some((name, arguments)) = calls.get(call_id) {
                        let (name, arguments) = (name.clone(), arguments.clone());
                        tracker.register(call_id, &name, &arguments, message.text());
                    }
                }
                _ => {}
            }
        }
        tracker
    }

    /// Marks the start of a model round; eviction ages are measured in these.
    pub fn advance_round(&mut self) {
        self.round += 1;
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn register(&mut self, call_id: &str, tool_name: &str, arguments: &str, result: &str) {
        if self.records.contains_key(call_id) {
            return;
        }

        let (retention, summarizer) = self.config.policy_for(tool_name);
        let summary = summarize(
            summarizer,
            tool_name,
            arguments,
            result,
            self.config.summary_limit,
        );
        let position = self.next_position;
        self.next_position += 1;

        debug!(call_id, tool_name, retention, "registered tool result");
        self.records.insert(
            call_id.to_string(),
            ToolCallRecord {
                tool_name: tool_name.to_string(),
                arguments: arguments.to_string(),
                result_len: result.chars().count(),
                summary,
                position,
                round: self.round,
                retention,
            },
        );
    }

    pub fn record(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.records.get(call_id)
    }

    /// A call is evictable once its result is big enough to matter and
    /// enough model rounds have passed since it was registered.
    pub fn should_evict(&self, call_id: &str) -> bool {
        let Some(record) = self.records.get(call_id) else {
            return false;
        };
        record.result_len >= self.config.min_result_len
            && self.round.saturating_sub(record.round) >= u64::from(record.retention)
    }
}

/// Rewrites the message list, collapsing evictable tool-call groups into
/// `[memory]` summary lines. Pure: the input is never mutated, the tail
/// group (calls the model has not yet replied to) is always left intact.
pub fn compress_messages(messages: &[Message], tracker: &ToolCallTracker) -> Vec<Message> {
    let protected = tail_protected_ids(messages);
    let mut dropped: HashSet<String> = HashSet::new();
    let mut output = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::Assistant if !message.tool_calls.is_empty() => {
                let (evicted, kept): (Vec<_>, Vec<_>) =
                    message.tool_calls.iter().cloned().partition(|call| {
                        !protected.contains(&call.id) && tracker.should_evict(&call.id)
                    });

                if evicted.is_empty() {
                    output.push(message.clone());
                    continue;
                }

                let mut lines = Vec::new();
                if let Some(content) = &message.content {
                    if !content.is_empty() {
                        lines.push(content.clone());
                    }
                }
                for call in &evicted {
                    dropped.insert(call.id.clone());
                    let summary = tracker
                        .record(&call.id)
                        .map(|record| record.summary.clone())
                        .unwrap_or_else(|| call.name.clone());
                    lines.push(format!("[memory] {summary} (recall:{})", call.id));
                }

                output.push(Message::assistant_with_tool_calls(
                    Some(lines.join("\n")),
                    kept,
                ));
            }
            Role::Tool => {
                let answered = message.tool_call_id.as_deref().unwrap_or_default();
                if !dropped.contains(answered) {
                    output.push(message.clone());
                }
            }
            _ => output.push(message.clone()),
        }
    }

    output
}

/// Tool-call ids of the pending tail: every assistant tool-call group after
/// the last user message or text-only assistant message.
fn tail_protected_ids(messages: &[Message]) -> HashSet<String> {
    let mut protected = HashSet::new();
    for message in messages.iter().rev() {
        match message.role {
            Role::User => break,
            Role::Assistant if message.tool_calls.is_empty() => break,
            Role::Assistant => {
                for call in &message.tool_calls {
                    protected.insert(call.id.clone());
                }
            }
            _ => {}
        }
    }
    protected
}

fn summarize(
    summarizer: Summarizer,
    tool_name: &str,
    arguments: &str,
    result: &str,
    limit: usize,
) -> String {
    match summarizer {
        Summarizer::Sql => {
            let query = extract_query_text(arguments);
            format!(
                "{tool_name}: {} rows for {}",
                count_rows(result),
                truncate_stating_elision(&one_line(&query), limit)
            )
        }
        Summarizer::Media => match extract_url(result) {
            Some(url) => format!("{tool_name}: {}", truncate_stating_elision(&url, limit)),
            None => format!(
                "{tool_name}: {}",
                truncate_stating_elision(&one_line(result), limit)
            ),
        },
        Summarizer::SideEffect => format!("{tool_name}: completed"),
        Summarizer::Generic => format!(
            "{tool_name}: {}",
            truncate_stating_elision(&one_line(result), limit)
        ),
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncates to `limit` characters, stating how many were elided.
fn truncate_stating_elision(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{kept}… ({} chars elided)", total - limit)
}

fn extract_query_text(arguments: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(arguments) else {
        return arguments.to_string();
    };
    for key in ["sql", "query", "statement"] {
        if let Some(text) = parsed.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    arguments.to_string()
}

fn count_rows(result: &str) -> usize {
    if let Ok(Value::Array(rows)) = serde_json::from_str::<Value>(result) {
        return rows.len();
    }
    result.lines().filter(|line| !line.trim().is_empty()).count()
}

fn extract_url(result: &str) -> Option<String> {
    result
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| c == '"' || c == '\'' || c == ','))
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(str::to_string)
}
