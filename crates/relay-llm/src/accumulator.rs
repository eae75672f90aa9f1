//! Assembles a `Completion` from a sequence of stream events.

use std::collections::BTreeMap;

use tracing::warn;

use crate::stream::{StreamEvent, ToolCallFragment};
use crate::types::{Completion, Message, ToolCall, Usage};

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates text deltas and indexed tool-call fragments.
///
/// Fragments are merged per index in arrival order: the first fragment that
/// carries an id or name wins those fields, every fragment's `arguments`
/// chunk is appended.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(delta),
            StreamEvent::ToolCallDelta(fragment) => self.merge_fragment(fragment),
            StreamEvent::Finish { usage } => {
                if usage.is_some() {
                    self.usage = usage.clone();
                }
            }
        }
    }

    /// Text accumulated so far; on cancellation this becomes the final reply.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish(self) -> Completion {
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for (index, partial) in self.calls {
            let (Some(id), Some(name)) = (partial.id, partial.name) else {
                warn!(index, "dropping tool-call fragment group without id/name");
                continue;
            };
            tool_calls.push(ToolCall {
                id,
                name,
                arguments: partial.arguments,
            });
        }

        let content = if self.text.is_empty() {
            None
        } else {
            Some(self.text)
        };
        Completion {
            message: Message::assistant_with_tool_calls(content, tool_calls),
            usage: self.usage,
        }
    }

    fn merge_fragment(&mut self, fragment: &ToolCallFragment) {
        let partial = self.calls.entry(fragment.index).or_default();
        if partial.id.is_none() {
            partial.id = fragment.id.clone();
        }
        if partial.name.is_none() {
            partial.name = fragment.name.clone();
        }
        partial.arguments.push_str(&fragment.arguments);
    }
}
