use crate::types::Usage;

/// A partial tool call as delivered by a streaming provider.
///
/// Fragments for the same `index` describe one call: the first fragment
/// carries the id and name, later fragments append to `arguments`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta(ToolCallFragment),
    Finish { usage: Option<Usage> },
}
