use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod auth;
pub mod bridge;
pub mod cache;
pub mod chat;
pub mod context;
pub mod drive;
pub mod protocol;
pub mod router;
pub mod store;
pub mod ui;
pub mod view_mode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Assistant,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Assistant => "assistant",
            SenderType::System => "system",
        }
    }
}

impl fmt::Display for SenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(SenderType::User),
            "assistant" | "agent" => Ok(SenderType::Assistant),
            "system" => Ok(SenderType::System),
            other => Err(format!("Unknown sender type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: String,
    pub sender_type: SenderType,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, rename = "isStreaming", skip_serializing_if = "is_false")]
    pub is_streaming: bool,
}

impl ChatMessage {
    pub fn assistant(conversation_id: &str, content: &str) -> Self {
        Self {
            id: None,
            conversation_id: conversation_id.to_string(),
            sender_type: SenderType::Assistant,
            sender_id: None,
            sender_name: None,
            content: content.to_string(),
            created_at: now_rfc3339(),
            is_streaming: false,
        }
    }

    pub fn user(
        conversation_id: &str,
        sender_id: Option<&str>,
        sender_name: Option<&str>,
        content: &str,
    ) -> Self {
        Self {
            id: None,
            conversation_id: conversation_id.to_string(),
            sender_type: SenderType::User,
            sender_id: sender_id.map(str::to_string),
            sender_name: sender_name.map(str::to_string),
            content: content.to_string(),
            created_at: now_rfc3339(),
            is_streaming: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl Conversation {
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => "Untitled chat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub has_api_key: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Started,
    Completed,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Started => "started",
            ToolCallStatus::Completed => "completed",
        }
    }

    /// The wire only distinguishes "started" from everything else.
    pub fn from_wire(status: &str) -> Self {
        if status.trim() == "started" {
            ToolCallStatus::Started
        } else {
            ToolCallStatus::Completed
        }
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRecord {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub label: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, rename = "callId", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub media_type: String,
    pub data: String,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Accepts a string, number, bool or structured value and renders it as text.
pub(crate) fn deserialize_text_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match val {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Ids arrive as strings from the API but some producers emit numbers.
pub(crate) fn deserialize_id_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_type_parses_aliases() {
        assert_eq!("Assistant".parse::<SenderType>(), Ok(SenderType::Assistant));
        assert_eq!("agent".parse::<SenderType>(), Ok(SenderType::Assistant));
        assert!("robot".parse::<SenderType>().is_err());
    }

    #[test]
    fn chat_message_tolerates_missing_optional_fields() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"conversation_id":"c1","sender_type":"user","content":"hi"}"#,
        )
        .expect("parse");
        assert_eq!(msg.id, None);
        assert_eq!(msg.sender_id, None);
        assert!(msg.created_at.is_empty());
        assert!(!msg.is_streaming);

        let encoded = serde_json::to_value(&msg).expect("encode");
        assert!(encoded.get("isStreaming").is_none());
    }

    #[test]
    fn tool_status_from_wire_treats_unknown_as_completed() {
        assert_eq!(ToolCallStatus::from_wire("started"), ToolCallStatus::Started);
        assert_eq!(ToolCallStatus::from_wire("completed"), ToolCallStatus::Completed);
        assert_eq!(ToolCallStatus::from_wire("failed"), ToolCallStatus::Completed);
    }

    #[test]
    fn conversation_title_falls_back() {
        let convo = Conversation {
            id: "c1".to_string(),
            title: Some("  ".to_string()),
            created_at: String::new(),
        };
        assert_eq!(convo.display_title(), "Untitled chat");
    }
}
