use relay_llm::ToolSchema;

/// Builds the system prompt for one model round.
///
/// Rebuilt every iteration so the prompt reflects the current tool catalog
/// and any other external state the implementation folds in.
pub trait PromptBuilder: Send + Sync {
    fn build_system_prompt(&self, tools: &[ToolSchema]) -> String;
}

/// Fixed preamble plus a generated tool digest.
pub struct StaticPromptBuilder {
    preamble: String,
}

impl StaticPromptBuilder {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
        }
    }
}

impl PromptBuilder for StaticPromptBuilder {
    fn build_system_prompt(&self, tools: &[ToolSchema]) -> String {
        if tools.is_empty() {
            return self.preamble.clone();
        }

        let mut prompt = self.preamble.clone();
        prompt.push_str("\n\n# Available tools\n");
        for tool in tools {
            prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        prompt
    }
}
