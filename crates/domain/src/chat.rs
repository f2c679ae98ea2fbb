use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// A function call surfaced to the caller by a previous turn, or echoed
/// back by the caller inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A message as it appears on the wire (API request/response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Function-result messages only: id of the surfaced call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function-result messages only: the function name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Assistant messages only: calls surfaced by a previous turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCallRef>,
}

// ── Convenience constructors ───────────────────────────────────────

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            call_id: None,
            name: None,
            function_calls: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            call_id: None,
            name: None,
            function_calls: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            call_id: None,
            name: None,
            function_calls: Vec::new(),
        }
    }

    pub fn function_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Function,
            content: content.into(),
            call_id: Some(call_id.into()),
            name: Some(name.into()),
            function_calls: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The canonical conversation form consumed by the inference runtime.
///
/// Invariant: at most one `System` item, and only at the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatHistoryItem {
    System { text: String },
    User { text: String },
    Model { response: Vec<ModelSegment> },
}

/// One segment of a model response: literal text, or a resolved function
/// call record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSegment {
    Text(String),
    FunctionCall(FunctionCallSegment),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallSegment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The call rendered in the model's native function-call syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ChatHistoryItem {
    /// An empty model item — the place generation writes into.
    pub fn model_placeholder() -> Self {
        ChatHistoryItem::Model {
            response: Vec::new(),
        }
    }

    pub fn is_model(&self) -> bool {
        matches!(self, ChatHistoryItem::Model { .. })
    }

    /// Concatenated text segments of a model item; empty for other kinds.
    pub fn model_text(&self) -> String {
        match self {
            ChatHistoryItem::Model { response } => response
                .iter()
                .filter_map(|s| match s {
                    ModelSegment::Text(t) => Some(t.as_str()),
                    ModelSegment::FunctionCall(_) => None,
                })
                .collect(),
            _ => String::new(),
        }
    }
}

/// Assemble wire messages into canonical history.
///
/// - All `system` text folds into a single leading `System` item; multiple
///   inputs are joined with a blank line.
/// - `assistant` messages become `Model` items — except messages that carry
///   only surfaced `function_calls` (empty text), which are skipped: their
///   calls are reconstructed from the instance's pending-call table when the
///   matching function results arrive.
/// - `function` messages are skipped here; the turn engine splices them
///   against the pending-call table.
pub fn assemble_history(messages: &[ChatMessage]) -> Vec<ChatHistoryItem> {
    let mut system_text = String::new();
    let mut items: Vec<ChatHistoryItem> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                if !system_text.is_empty() {
                    system_text.push_str("\n\n");
                }
                system_text.push_str(&msg.content);
            }
            Role::User => items.push(ChatHistoryItem::User {
                text: msg.content.clone(),
            }),
            Role::Assistant => {
                if msg.content.is_empty() && !msg.function_calls.is_empty() {
                    continue;
                }
                items.push(ChatHistoryItem::Model {
                    response: vec![ModelSegment::Text(msg.content.clone())],
                });
            }
            Role::Function => continue,
        }
    }

    if !system_text.is_empty() {
        items.insert(0, ChatHistoryItem::System { text: system_text });
    }
    items
}

/// Length (in items) of the longest common prefix of two histories.
/// This is the affinity score used by pool routing.
pub fn common_prefix_len(a: &[ChatHistoryItem], b: &[ChatHistoryItem]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
