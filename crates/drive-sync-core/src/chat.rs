use crate::store::Store;
use crate::{ChatMessage, ToolCallRecord, ToolCallStatus};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Appended to a partially streamed reply when the connection drops mid-turn.
pub const CONNECTION_LOST_MARKER: &str = "\n\n*(connection lost)*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub is_agent_typing: bool,
    pub streaming_content: String,
    pub active_tool_call: Option<String>,
    pub tool_history: Vec<ToolCallRecord>,
    pub pending_prompt: Option<String>,
    /// user id -> display name of peers currently typing.
    pub typing_peers: BTreeMap<String, String>,
}

impl ChatState {
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

#[derive(Debug, Default)]
pub struct ChatStore {
    state: Store<ChatState>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.snapshot()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        self.state.read(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn add_message(&self, msg: ChatMessage) {
        self.state.mutate(|s| {
            s.messages.push(msg);
            true
        });
    }

    pub fn set_messages(&self, messages: Vec<ChatMessage>) {
        self.state.mutate(|s| {
            s.messages = messages;
            true
        });
    }

    /// Concatenates onto the in-progress reply and marks the agent as working,
    /// even if the turn's start was never observed.
    pub fn append_delta(&self, delta: &str) {
        self.state.mutate(|s| {
            if delta.is_empty() && s.is_agent_typing {
                return false;
            }
            s.streaming_content.push_str(delta);
            s.is_agent_typing = true;
            true
        });
    }

    /// Closes the turn: clears the buffer and tool progress and appends one
    /// immutable assistant message.
    pub fn finalize(&self, content: &str, conversation_id: Option<&str>) {
        self.state.mutate(|s| {
            let conversation_id = conversation_id
                .map(str::to_string)
                .or_else(|| s.conversation_id.clone())
                .unwrap_or_default();
            s.streaming_content.clear();
            s.is_agent_typing = false;
            s.active_tool_call = None;
            s.tool_history.clear();
            s.messages.push(ChatMessage::assistant(&conversation_id, content));
            true
        });
    }

    /// Recovery for a transport close. A turn that produced output or tool
    /// progress is saved with the connection-lost marker; an idle working flag
    /// is just cleared. Returns true when a message was appended.
    pub fn force_finalize(&self) -> bool {
        let mut saved = false;
        self.state.mutate(|s| {
            let produced = !s.streaming_content.is_empty() || !s.tool_history.is_empty();
            if produced {
                let content = format!("{}{}", s.streaming_content, CONNECTION_LOST_MARKER);
                let conversation_id = s.conversation_id.clone().unwrap_or_default();
                s.messages.push(ChatMessage::assistant(&conversation_id, &content));
                saved = true;
            } else if !s.is_agent_typing && s.active_tool_call.is_none() {
                return false;
            }
            s.streaming_content.clear();
            s.is_agent_typing = false;
            s.active_tool_call = None;
            s.tool_history.clear();
            true
        });
        saved
    }

    /// Drops the in-flight turn without saving anything.
    pub fn abandon_turn(&self) {
        self.state.mutate(|s| {
            let busy = s.is_agent_typing
                || !s.streaming_content.is_empty()
                || !s.tool_history.is_empty()
                || s.active_tool_call.is_some();
            s.streaming_content.clear();
            s.is_agent_typing = false;
            s.active_tool_call = None;
            s.tool_history.clear();
            busy
        });
    }

    pub fn set_agent_typing(&self, typing: bool) {
        self.state.mutate(|s| {
            if s.is_agent_typing == typing {
                return false;
            }
            s.is_agent_typing = typing;
            true
        });
    }

    pub fn add_tool_call(&self, tool_name: &str, label: &str, call_id: Option<&str>) {
        self.state.mutate(|s| {
            s.active_tool_call = Some(tool_name.to_string());
            s.tool_history.push(ToolCallRecord {
                tool_name: tool_name.to_string(),
                label: label.to_string(),
                status: ToolCallStatus::Started,
                result: None,
                call_id: call_id.map(str::to_string),
            });
            true
        });
    }

    /// Marks the matching started call completed. A call id, when both sides
    /// carry one, wins; otherwise the most recent started record with the same
    /// label is taken. Returns false and leaves the history untouched when
    /// nothing matches.
    pub fn complete_tool_call(
        &self,
        tool_name: &str,
        label: &str,
        result: Option<&str>,
        call_id: Option<&str>,
    ) -> bool {
        self.state.mutate(|s| {
            let Some(idx) = find_started(&s.tool_history, label, call_id) else {
                return false;
            };
            let record = &mut s.tool_history[idx];
            record.status = ToolCallStatus::Completed;
            record.result = result.map(str::to_string);
            if s.active_tool_call.as_deref() == Some(tool_name) {
                s.active_tool_call = None;
            }
            true
        })
    }

    pub fn set_peer_typing(&self, user_id: &str, display_name: &str, typing: bool) {
        self.state.mutate(|s| {
            if typing {
                s.typing_peers
                    .insert(user_id.to_string(), display_name.to_string())
                    .as_deref()
                    != Some(display_name)
            } else {
                s.typing_peers.remove(user_id).is_some()
            }
        });
    }

    pub fn set_pending_prompt(&self, prompt: Option<String>) {
        self.state.mutate(|s| {
            s.pending_prompt = prompt;
            true
        });
    }

    pub fn take_pending_prompt(&self) -> Option<String> {
        let mut taken = None;
        self.state.mutate(|s| {
            taken = s.pending_prompt.take();
            taken.is_some()
        });
        taken
    }

    /// Clears the transcript and any in-flight turn state. The prior turn keeps
    /// running server-side; only its visibility is lost.
    pub fn clear(&self) {
        self.state.mutate(|s| {
            s.messages.clear();
            s.streaming_content.clear();
            s.is_agent_typing = false;
            s.active_tool_call = None;
            s.tool_history.clear();
            s.typing_peers.clear();
            true
        });
    }

    /// Switches the active conversation. Returns false when `conversation_id`
    /// is already active.
    pub fn switch_conversation(&self, conversation_id: &str) -> bool {
        if self.read(|s| s.conversation_id.as_deref() == Some(conversation_id)) {
            return false;
        }
        self.clear();
        self.state.mutate(|s| {
            s.conversation_id = Some(conversation_id.to_string());
            true
        });
        true
    }

    pub fn reset(&self) {
        self.state.replace(ChatState::default());
    }
}

fn find_started(history: &[ToolCallRecord], label: &str, call_id: Option<&str>) -> Option<usize> {
    let started = |r: &ToolCallRecord| r.status == ToolCallStatus::Started;
    if let Some(id) = call_id {
        if let Some(idx) = history
            .iter()
            .rposition(|r| started(r) && r.call_id.as_deref() == Some(id))
        {
            return Some(idx);
        }
    }
    history.iter().rposition(|r| started(r) && r.label == label)
}
