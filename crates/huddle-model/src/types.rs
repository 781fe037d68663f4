use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// The content of a message.
///
/// - `Text` – plain text (most messages)
/// - `Blocks` – an assistant turn mixing text with tool-use requests
/// - `ToolResults` – ONE user message carrying the result block for every
///   tool-use of the previous assistant turn.  The tool-calling contract
///   demands exactly one result per tool-use, delivered together; the type
///   makes the batched shape the only representable one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    ToolResults(Vec<ToolResultBlock>),
}

/// One block of an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolUseBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Opaque identifier minted by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Assistant turn with explicit blocks (text and/or tool uses).
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The single user message answering the previous assistant turn's
    /// tool uses.
    pub fn tool_results(results: Vec<ToolResultBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::ToolResults(results),
        }
    }

    /// Plain text of this message, when it is a simple text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Tool-use blocks of this message, in order (empty for non-assistant
    /// or text-only turns).
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(tu) => Some(tu),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }
}

/// A tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a completion provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

/// A single streamed event from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A thinking/reasoning delta from the model
    ThinkingDelta(String),
    /// The model wants to call a tool.  Arguments may arrive across
    /// multiple deltas for the same `index`; callers accumulate until
    /// `Done`.
    ToolUse {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Final usage statistics
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn tool_results_message_is_a_user_turn() {
        let m = Message::tool_results(vec![ToolResultBlock {
            tool_use_id: "tu_1".into(),
            content: "ok".into(),
            is_error: false,
        }]);
        assert_eq!(m.role, Role::User);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn tool_uses_extracts_only_tool_blocks() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::Text {
                text: "running it now".into(),
            },
            ContentBlock::ToolUse(ToolUseBlock {
                id: "tu_1".into(),
                name: "shell".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }),
        ]);
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].name, "shell");
    }

    #[test]
    fn text_message_has_no_tool_uses() {
        assert!(Message::assistant("done").tool_uses().is_empty());
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::assistant_blocks(vec![ContentBlock::ToolUse(ToolUseBlock {
            id: "tu_9".into(),
            name: "web_fetch".into(),
            arguments: serde_json::json!({"url": "http://localhost"}),
        })]);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn tool_result_block_round_trip_defaults_is_error() {
        let json = r#"{"tool_use_id":"tu_1","content":"output"}"#;
        let b: ToolResultBlock = serde_json::from_str(json).unwrap();
        assert!(!b.is_error);
    }
}
