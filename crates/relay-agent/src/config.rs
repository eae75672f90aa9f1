use serde::{Deserialize, Serialize};

/// Runtime configuration for an agent-loop instance.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopConfig {
    pub model: Option<String>,
    /// Upper bound on model rounds per run; a runaway tool loop fails the
    /// run instead of spinning forever.
    pub max_rounds: usize,
    pub eviction: EvictionConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_rounds: 50,
            eviction: EvictionConfig::default(),
        }
    }
}

/// How a tool result is condensed into its one-line summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Summarizer {
    /// Row count plus truncated query text.
    Sql,
    /// Truncated URL of the produced media.
    Media,
    /// Fixed confirmation line for pure side-effect tools.
    SideEffect,
    /// `name: truncated-result`.
    Generic,
}

/// One row of the eviction policy table. `pattern` is an exact tool name or
/// a trailing-`*` prefix; the first matching row wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    pub retention: u32,
    pub summarizer: Summarizer,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, retention: u32, summarizer: Summarizer) -> Self {
        Self {
            pattern: pattern.into(),
            retention,
            summarizer,
        }
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => tool_name.starts_with(prefix),
            None => tool_name == self.pattern,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvictionConfig {
    /// Results shorter than this are never worth compressing.
    pub min_result_len: usize,
    /// Rounds a result survives when no policy rule matches its tool.
    pub default_retention: u32,
    /// Characters of result/query/URL text kept inside a summary.
    pub summary_limit: usize,
    pub rules: Vec<PolicyRule>,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_result_len: 200,
            default_retention: 3,
            summary_limit: 120,
            rules: default_policy_rules(),
        }
    }
}

impl EvictionConfig {
    /// Retention and summary shape for a tool, from the first matching rule.
    pub fn policy_for(&self, tool_name: &str) -> (u32, Summarizer) {
        for rule in &self.rules {
            if rule.matches(tool_name) {
                return (rule.retention, rule.summarizer);
            }
        }
        (self.default_retention, Summarizer::Generic)
    }
}

pub fn default_policy_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule::new("run_sql", 10, Summarizer::Sql),
        PolicyRule::new("query_*", 10, Summarizer::Sql),
        PolicyRule::new("generate_*", 10, Summarizer::Media),
        PolicyRule::new("create_*", 0, Summarizer::SideEffect),
        PolicyRule::new("update_*", 0, Summarizer::SideEffect),
        PolicyRule::new("delete_*", 0, Summarizer::SideEffect),
    ]
}
