use crate::{deserialize_id_opt, deserialize_text_opt, Attachment, ChatMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Close code the server uses when the bearer token is missing or rejected.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum InboundEvent {
    #[serde(rename = "chat.message")]
    ChatMessage(ChatMessage),
    #[serde(rename = "chat.typing")]
    ChatTyping(TypingPayload),
    #[serde(rename = "agent.stream_delta")]
    StreamDelta(StreamDeltaPayload),
    #[serde(rename = "agent.stream_end")]
    StreamEnd(StreamEndPayload),
    #[serde(rename = "agent.tool_use")]
    ToolUse(ToolUsePayload),
    #[serde(rename = "file.created")]
    FileCreated(FileMutationPayload),
    #[serde(rename = "file.updated")]
    FileUpdated(FileMutationPayload),
    #[serde(rename = "file.deleted")]
    FileDeleted(FileMutationPayload),
    #[serde(rename = "folder.created")]
    FolderCreated(FolderMutationPayload),
    #[serde(rename = "folder.updated")]
    FolderUpdated(FolderMutationPayload),
    #[serde(rename = "folder.deleted")]
    FolderDeleted(FolderMutationPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "pong")]
    Pong,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::ChatMessage(_) => "chat.message",
            InboundEvent::ChatTyping(_) => "chat.typing",
            InboundEvent::StreamDelta(_) => "agent.stream_delta",
            InboundEvent::StreamEnd(_) => "agent.stream_end",
            InboundEvent::ToolUse(_) => "agent.tool_use",
            InboundEvent::FileCreated(_) => "file.created",
            InboundEvent::FileUpdated(_) => "file.updated",
            InboundEvent::FileDeleted(_) => "file.deleted",
            InboundEvent::FolderCreated(_) => "folder.created",
            InboundEvent::FolderUpdated(_) => "folder.updated",
            InboundEvent::FolderDeleted(_) => "folder.deleted",
            InboundEvent::Error(_) => "error",
            InboundEvent::Pong => "pong",
        }
    }

    /// The entity mutation carried by file/folder notices, if any.
    pub fn mutation(&self) -> Option<EntityMutation> {
        let (entity, op, id) = match self {
            InboundEvent::FileCreated(p) => (EntityKind::File, MutationOp::Created, &p.file_id),
            InboundEvent::FileUpdated(p) => (EntityKind::File, MutationOp::Updated, &p.file_id),
            InboundEvent::FileDeleted(p) => (EntityKind::File, MutationOp::Deleted, &p.file_id),
            InboundEvent::FolderCreated(p) => {
                (EntityKind::Folder, MutationOp::Created, &p.folder_id)
            }
            InboundEvent::FolderUpdated(p) => {
                (EntityKind::Folder, MutationOp::Updated, &p.folder_id)
            }
            InboundEvent::FolderDeleted(p) => {
                (EntityKind::Folder, MutationOp::Deleted, &p.folder_id)
            }
            _ => return None,
        };
        Some(EntityMutation {
            entity,
            op,
            id: id.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDeltaPayload {
    pub delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamEndPayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolUsePayload {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: String,
    #[serde(
        default,
        deserialize_with = "deserialize_text_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ToolUsePayload {
    /// Producers may omit the label; the tool name stands in for it.
    pub fn effective_label(&self) -> &str {
        match self.label.as_deref() {
            Some(label) if !label.is_empty() => label,
            _ => &self.tool_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileMutationPayload {
    #[serde(default, deserialize_with = "deserialize_id_opt")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FolderMutationPayload {
    #[serde(default, deserialize_with = "deserialize_id_opt")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOp {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMutation {
    pub entity: EntityKind,
    pub op: MutationOp,
    pub id: Option<String>,
}

impl fmt::Display for EntityMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity = match self.entity {
            EntityKind::File => "file",
            EntityKind::Folder => "folder",
        };
        let op = match self.op {
            MutationOp::Created => "created",
            MutationOp::Updated => "updated",
            MutationOp::Deleted => "deleted",
        };
        write!(f, "{entity}.{op}")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundCommand {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "agent.invoke")]
    AgentInvoke(AgentInvokePayload),
    #[serde(rename = "agent.stop")]
    AgentStop(AgentStopPayload),
    #[serde(rename = "chat.message")]
    ChatMessage(ChatSendPayload),
    #[serde(rename = "chat.typing")]
    ChatTyping(TypingSendPayload),
}

impl OutboundCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::Ping => "ping",
            OutboundCommand::AgentInvoke(_) => "agent.invoke",
            OutboundCommand::AgentStop(_) => "agent.stop",
            OutboundCommand::ChatMessage(_) => "chat.message",
            OutboundCommand::ChatTyping(_) => "chat.typing",
        }
    }

    pub fn invoke(conversation_id: &str, message: &str, attachments: Vec<Attachment>) -> Self {
        OutboundCommand::AgentInvoke(AgentInvokePayload {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            attachments: if attachments.is_empty() {
                None
            } else {
                Some(attachments)
            },
        })
    }

    pub fn stop(conversation_id: &str) -> Self {
        OutboundCommand::AgentStop(AgentStopPayload {
            conversation_id: conversation_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInvokePayload {
    pub conversation_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStopPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSendPayload {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingSendPayload {
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid {kind} payload: {message}")]
    Payload { kind: String, message: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn decode_raw(text: &str, max_frame_bytes: usize) -> Result<RawFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|err| FrameError::Payload {
        kind: kind.to_string(),
        message: err.to_string(),
    })
}

/// Decodes one inbound text frame. Unknown event types yield `Ok(None)` so
/// newer servers can add events without breaking this client.
pub fn decode_event(text: &str, max_frame_bytes: usize) -> Result<Option<InboundEvent>, FrameError> {
    let RawFrame { kind, payload: body } = decode_raw(text, max_frame_bytes)?;
    let kind = kind.as_str();
    let event = match kind {
        "chat.message" => InboundEvent::ChatMessage(payload(kind, body)?),
        "chat.typing" => InboundEvent::ChatTyping(payload(kind, body)?),
        "agent.stream_delta" => InboundEvent::StreamDelta(payload(kind, body)?),
        "agent.stream_end" => InboundEvent::StreamEnd(payload(kind, body)?),
        "agent.tool_use" => InboundEvent::ToolUse(payload(kind, body)?),
        "file.created" => InboundEvent::FileCreated(payload(kind, body)?),
        "file.updated" => InboundEvent::FileUpdated(payload(kind, body)?),
        "file.deleted" => InboundEvent::FileDeleted(payload(kind, body)?),
        "folder.created" => InboundEvent::FolderCreated(payload(kind, body)?),
        "folder.updated" => InboundEvent::FolderUpdated(payload(kind, body)?),
        "folder.deleted" => InboundEvent::FolderDeleted(payload(kind, body)?),
        "error" => InboundEvent::Error(payload(kind, body)?),
        "pong" => InboundEvent::Pong,
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Server-side counterpart of [`decode_event`].
pub fn decode_command(
    text: &str,
    max_frame_bytes: usize,
) -> Result<Option<OutboundCommand>, FrameError> {
    let RawFrame { kind, payload: body } = decode_raw(text, max_frame_bytes)?;
    let kind = kind.as_str();
    let command = match kind {
        "ping" => OutboundCommand::Ping,
        "agent.invoke" => OutboundCommand::AgentInvoke(payload(kind, body)?),
        "agent.stop" => OutboundCommand::AgentStop(payload(kind, body)?),
        "chat.message" => OutboundCommand::ChatMessage(payload(kind, body)?),
        "chat.typing" => OutboundCommand::ChatTyping(payload(kind, body)?),
        _ => return Ok(None),
    };
    Ok(Some(command))
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}
