//! Core message domain model.
//!
//! `Message` is a sum type over role. Role-specific fields exist only on the
//! variant that needs them (`tool_calls` on assistant turns, `tool_call_id`
//! on tool turns), so pairing invariants are validated at construction, not
//! at every read site. Constructors take the timestamp explicitly; callers
//! own the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NonEmptyString;

#[derive(Debug, Error)]
pub enum MessageError {
    /// An assistant turn must carry text, tool calls, or both.
    #[error("assistant message must have content or tool calls")]
    EmptyAssistantMessage,
    /// Tool call ids must be unique within one assistant turn.
    #[error("duplicate tool call id within one message: {0}")]
    DuplicateToolCallId(String),
}

/// One tool invocation declared by an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call (tool results are matched against it).
    pub id: String,
    /// The name of the tool being invoked.
    pub name: String,
    /// The arguments to pass to the tool, as parsed JSON.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    content: NonEmptyString,
    timestamp: DateTime<Utc>,
}

impl SystemMessage {
    #[must_use]
    pub fn new(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self { content, timestamp }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    content: NonEmptyString,
    timestamp: DateTime<Utc>,
}

impl UserMessage {
    #[must_use]
    pub fn new(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self { content, timestamp }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An assistant turn: text, tool calls, or both.
///
/// Content may be absent only when `tool_calls` is non-empty (a pure
/// "calling" turn). `with_tool_calls` enforces this and rejects duplicate
/// call ids within the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    content: Option<NonEmptyString>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    tool_calls: Vec<ToolCall>,
    timestamp: DateTime<Utc>,
    /// Provider-assigned response id, when the transport reports one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    provider_response_id: Option<String>,
}

impl AssistantMessage {
    #[must_use]
    pub fn new(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: Some(content),
            tool_calls: Vec::new(),
            timestamp,
            provider_response_id: None,
        }
    }

    pub fn with_tool_calls(
        content: Option<NonEmptyString>,
        tool_calls: Vec<ToolCall>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        if content.is_none() && tool_calls.is_empty() {
            return Err(MessageError::EmptyAssistantMessage);
        }
        for (index, call) in tool_calls.iter().enumerate() {
            if tool_calls[..index].iter().any(|c| c.id == call.id) {
                return Err(MessageError::DuplicateToolCallId(call.id.clone()));
            }
        }
        Ok(Self {
            content,
            tool_calls,
            timestamp,
            provider_response_id: None,
        })
    }

    #[must_use]
    pub fn with_provider_response_id(mut self, id: impl Into<String>) -> Self {
        self.provider_response_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_ref().map_or("", NonEmptyString::as_str)
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    #[must_use]
    pub fn provider_response_id(&self) -> Option<&str> {
        self.provider_response_id.as_deref()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A tool-result turn answering one prior assistant `ToolCall`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMessage {
    tool_call_id: String,
    tool_name: String,
    content: String,
    is_error: bool,
    timestamp: DateTime<Utc>,
}

impl ToolMessage {
    #[must_use]
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: false,
            timestamp,
        }
    }

    #[must_use]
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: error.into(),
            is_error: true,
            timestamp,
        }
    }

    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A complete conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
    Assistant(AssistantMessage),
    Tool(ToolMessage),
}

impl Message {
    #[must_use]
    pub fn system(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self::System(SystemMessage::new(content, timestamp))
    }

    #[must_use]
    pub fn user(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self::User(UserMessage::new(content, timestamp))
    }

    pub fn try_user(
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, crate::EmptyStringError> {
        Ok(Self::user(NonEmptyString::new(content)?, timestamp))
    }

    #[must_use]
    pub fn assistant(content: NonEmptyString, timestamp: DateTime<Utc>) -> Self {
        Self::Assistant(AssistantMessage::new(content, timestamp))
    }

    pub fn assistant_with_tool_calls(
        content: Option<NonEmptyString>,
        tool_calls: Vec<ToolCall>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        Ok(Self::Assistant(AssistantMessage::with_tool_calls(
            content, tool_calls, timestamp,
        )?))
    }

    #[must_use]
    pub fn tool(result: ToolMessage) -> Self {
        Self::Tool(result)
    }

    #[must_use]
    pub fn role_str(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::Tool(_) => "tool",
        }
    }

    /// Text content for estimation and scoring. Empty for pure calling turns.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Message::System(m) => m.content(),
            Message::User(m) => m.content(),
            Message::Assistant(m) => m.content(),
            Message::Tool(m) => m.content(),
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Message::System(m) => m.timestamp(),
            Message::User(m) => m.timestamp(),
            Message::Assistant(m) => m.timestamp(),
            Message::Tool(m) => m.timestamp(),
        }
    }

    /// Tool calls declared by this message. Empty unless assistant.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant(m) => m.tool_calls(),
            _ => &[],
        }
    }

    /// The call this message answers, when it is a tool result.
    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Message::Tool(m) => Some(m.tool_call_id()),
            _ => None,
        }
    }
}
