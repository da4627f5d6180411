//! Claude Code transcript parsing.
//!
//! A transcript blob is newline-delimited JSON. Each record carries a
//! `type` tag; user and assistant records hold the message content as
//! either a plain string or an array of typed blocks. Compact boundaries
//! partition the transcript: every message after a boundary is marked
//! compacted with the boundary's sequence number.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::core::session::{BlockType, ContentBlock, MessageRole, TranscriptMessage};

/// Parsed form of one transcript blob.
#[derive(Debug, Default)]
pub struct ParsedTranscript {
    pub messages: Vec<TranscriptMessage>,
    pub blocks: Vec<ContentBlock>,
    /// Lines that did not decode as transcript records.
    pub skipped_lines: usize,
    /// Sum of per-message costs, when any were present.
    pub cost_estimate_usd: Option<f64>,
}

impl ParsedTranscript {
    /// Concatenated text of the first blocks, for the summary provider.
    #[must_use]
    pub fn excerpt(&self) -> String {
        let mut excerpt = String::new();
        for block in &self.blocks {
            if let Some(text) = &block.content_text {
                excerpt.push_str(text);
                excerpt.push('\n');
            }
            if excerpt.len() >= 32 * 1024 {
                break;
            }
        }
        excerpt
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
enum TranscriptRecord {
    User(UserRecord),
    Assistant(AssistantRecord),
    System(SystemRecord),
    Compact(CompactRecord),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(default)]
    timestamp: Option<String>,
    message: UserMessage,
}

#[derive(Debug, Deserialize)]
struct UserMessage {
    #[serde(deserialize_with = "deserialize_user_content")]
    content: Vec<UserContent>,
}

fn deserialize_user_content<'de, D>(deserializer: D) -> Result<Vec<UserContent>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrArray {
        String(String),
        Array(Vec<UserContent>),
    }

    match StringOrArray::deserialize(deserializer)? {
        StringOrArray::String(s) => Ok(vec![UserContent::Text { text: s }]),
        StringOrArray::Array(arr) => Ok(arr),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum UserContent {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistantRecord {
    #[serde(default)]
    timestamp: Option<String>,
    message: AssistantMessage,
    #[serde(default, rename = "costUSD")]
    cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AssistantContent>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum AssistantContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: Option<i64>,
    #[serde(default)]
    output_tokens: Option<i64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<i64>,
    #[serde(default)]
    cache_read_input_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemRecord {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompactRecord {}

fn parse_record_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(Into::into)
}

/// Parse a transcript blob into messages and content blocks with
/// deterministic keys: ordinals 1..N and `<session_id>:<ordinal>` message
/// ids, so re-running the same blob re-produces the same rows.
#[must_use]
pub fn parse_transcript(session_id: &str, blob: &[u8]) -> ParsedTranscript {
    let text = String::from_utf8_lossy(blob);
    let mut out = ParsedTranscript::default();
    let mut ordinal: i64 = 0;
    let mut compact_sequence: i64 = 0;
    let mut cost_total: Option<f64> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: TranscriptRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(session_id, error = %e, "Skipping undecodable transcript line");
                out.skipped_lines += 1;
                continue;
            }
        };

        match record {
            TranscriptRecord::User(user) => {
                ordinal += 1;
                let message_id = format!("{session_id}:{ordinal}");
                let mut block_order = 0;
                for content in user.message.content {
                    if let Some(block) =
                        user_block(&message_id, session_id, block_order, content)
                    {
                        out.blocks.push(block);
                        block_order += 1;
                    }
                }
                out.messages.push(TranscriptMessage {
                    id: message_id,
                    session_id: session_id.to_owned(),
                    ordinal,
                    role: MessageRole::User,
                    timestamp: parse_record_ts(user.timestamp.as_deref()),
                    model: None,
                    input_tokens: None,
                    output_tokens: None,
                    cache_creation_tokens: None,
                    cache_read_tokens: None,
                    cost_usd: None,
                    is_compacted: compact_sequence > 0,
                    compact_sequence,
                });
            }
            TranscriptRecord::Assistant(assistant) => {
                ordinal += 1;
                let message_id = format!("{session_id}:{ordinal}");
                let mut block_order = 0;
                for content in assistant.message.content {
                    if let Some(block) =
                        assistant_block(&message_id, session_id, block_order, content)
                    {
                        out.blocks.push(block);
                        block_order += 1;
                    }
                }
                if let Some(cost) = assistant.cost_usd {
                    cost_total = Some(cost_total.unwrap_or(0.0) + cost);
                }
                let usage = assistant.message.usage;
                out.messages.push(TranscriptMessage {
                    id: message_id,
                    session_id: session_id.to_owned(),
                    ordinal,
                    role: MessageRole::Assistant,
                    timestamp: parse_record_ts(assistant.timestamp.as_deref()),
                    model: assistant.message.model,
                    input_tokens: usage.as_ref().and_then(|u| u.input_tokens),
                    output_tokens: usage.as_ref().and_then(|u| u.output_tokens),
                    cache_creation_tokens: usage
                        .as_ref()
                        .and_then(|u| u.cache_creation_input_tokens),
                    cache_read_tokens: usage.as_ref().and_then(|u| u.cache_read_input_tokens),
                    cost_usd: assistant.cost_usd,
                    is_compacted: compact_sequence > 0,
                    compact_sequence,
                });
            }
            TranscriptRecord::System(system) => {
                if system.subtype.as_deref() == Some("compact_boundary") {
                    compact_sequence += 1;
                    continue;
                }
                let Some(content) = system.content.filter(|c| !c.trim().is_empty()) else {
                    continue;
                };
                ordinal += 1;
                let message_id = format!("{session_id}:{ordinal}");
                out.blocks.push(ContentBlock {
                    message_id: message_id.clone(),
                    session_id: session_id.to_owned(),
                    block_order: 0,
                    block_type: BlockType::Text,
                    content_text: Some(content),
                    thinking_text: None,
                    tool_name: None,
                    tool_input: None,
                    tool_result_id: None,
                    is_error: None,
                    result_text: None,
                });
                out.messages.push(TranscriptMessage {
                    id: message_id,
                    session_id: session_id.to_owned(),
                    ordinal,
                    role: MessageRole::System,
                    timestamp: parse_record_ts(system.timestamp.as_deref()),
                    model: None,
                    input_tokens: None,
                    output_tokens: None,
                    cache_creation_tokens: None,
                    cache_read_tokens: None,
                    cost_usd: None,
                    is_compacted: compact_sequence > 0,
                    compact_sequence,
                });
            }
            TranscriptRecord::Compact(_) => {
                compact_sequence += 1;
            }
            TranscriptRecord::Unknown => {}
        }
    }

    out.cost_estimate_usd = cost_total;
    out
}

fn user_block(
    message_id: &str,
    session_id: &str,
    block_order: i64,
    content: UserContent,
) -> Option<ContentBlock> {
    let base = ContentBlock {
        message_id: message_id.to_owned(),
        session_id: session_id.to_owned(),
        block_order,
        block_type: BlockType::Text,
        content_text: None,
        thinking_text: None,
        tool_name: None,
        tool_input: None,
        tool_result_id: None,
        is_error: None,
        result_text: None,
    };

    match content {
        UserContent::Text { text } => Some(ContentBlock {
            content_text: Some(text),
            ..base
        }),
        UserContent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(ContentBlock {
            block_type: BlockType::ToolResult,
            tool_result_id: Some(tool_use_id),
            is_error: Some(is_error),
            result_text: Some(stringify_result(&content)),
            ..base
        }),
        UserContent::Unknown => None,
    }
}

fn assistant_block(
    message_id: &str,
    session_id: &str,
    block_order: i64,
    content: AssistantContent,
) -> Option<ContentBlock> {
    let base = ContentBlock {
        message_id: message_id.to_owned(),
        session_id: session_id.to_owned(),
        block_order,
        block_type: BlockType::Text,
        content_text: None,
        thinking_text: None,
        tool_name: None,
        tool_input: None,
        tool_result_id: None,
        is_error: None,
        result_text: None,
    };

    match content {
        AssistantContent::Text { text } => Some(ContentBlock {
            content_text: Some(text),
            ..base
        }),
        AssistantContent::Thinking { thinking } => Some(ContentBlock {
            block_type: BlockType::Thinking,
            thinking_text: Some(thinking),
            ..base
        }),
        AssistantContent::ToolUse { id, name, input } => Some(ContentBlock {
            block_type: BlockType::ToolUse,
            tool_name: Some(name),
            tool_input: Some(input),
            tool_result_id: Some(id),
            ..base
        }),
        AssistantContent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(ContentBlock {
            block_type: BlockType::ToolResult,
            tool_result_id: Some(tool_use_id),
            is_error: Some(is_error),
            result_text: Some(stringify_result(&content)),
            ..base
        }),
        AssistantContent::Unknown => None,
    }
}

/// Tool results arrive as a string or structured content; keep a flat text
/// form either way.
fn stringify_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
