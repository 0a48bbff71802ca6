use crate::error::ClientError;
use crate::manager::ConnectionManager;
use crate::rest::DriveApi;
use drive_sync_core::auth::Session;
use drive_sync_core::cache::{CacheRegion, QueryKey};
use drive_sync_core::context::AppContext;
use drive_sync_core::protocol::{ChatSendPayload, OutboundCommand, TypingSendPayload};
use drive_sync_core::{Attachment, ChatMessage};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const NEW_CONVERSATION_TITLE: &str = "New chat";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("message is empty")]
    Empty,
    #[error("no active conversation")]
    NoConversation,
    #[error("the agent is still working")]
    Busy,
    #[error("not connected")]
    NotConnected,
}

/// Chat-facing operations layered over the connection manager and the REST
/// client. All state lives in the shared context.
#[derive(Debug, Clone)]
pub struct ChatSession {
    ctx: Arc<AppContext>,
    conn: ConnectionManager,
    api: DriveApi,
}

impl ChatSession {
    pub fn new(conn: ConnectionManager, api: DriveApi) -> Self {
        Self {
            ctx: conn.context().clone(),
            conn,
            api,
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Starts an agent turn: appends the local user message, marks the agent
    /// as working and sends `agent.invoke`. A dropped send clears the working
    /// flag again; the message stays so the user can resubmit it.
    pub async fn submit_prompt(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::Empty);
        }
        let (conversation_id, busy) = self
            .ctx
            .chat
            .read(|s| (s.conversation_id.clone(), s.is_agent_typing));
        let conversation_id = conversation_id.ok_or(SubmitError::NoConversation)?;
        if busy {
            return Err(SubmitError::Busy);
        }

        let user = self.ctx.auth.user();
        self.ctx.chat.add_message(ChatMessage::user(
            &conversation_id,
            user.as_ref().map(|u| u.id.as_str()),
            user.as_ref().map(|u| u.display_name.as_str()),
            text,
        ));
        self.ctx.chat.set_agent_typing(true);

        let command = OutboundCommand::invoke(&conversation_id, text, attachments);
        if !self.conn.send(command).await {
            self.ctx.chat.set_agent_typing(false);
            return Err(SubmitError::NotConnected);
        }
        info!(event = "agent_invoked", conversation_id = %conversation_id);
        Ok(())
    }

    /// Asks the server to cancel the running turn; the server answers with a
    /// stopped `agent.stream_end`.
    pub async fn stop(&self) -> Result<(), SubmitError> {
        let conversation_id = self
            .ctx
            .chat
            .read(|s| s.conversation_id.clone())
            .ok_or(SubmitError::NoConversation)?;
        if !self.conn.send(OutboundCommand::stop(&conversation_id)).await {
            return Err(SubmitError::NotConnected);
        }
        Ok(())
    }

    /// Posts a plain chat message for other participants; no agent turn.
    pub async fn say(&self, text: &str) -> Result<(), SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::Empty);
        }
        let conversation_id = self
            .ctx
            .chat
            .read(|s| s.conversation_id.clone())
            .ok_or(SubmitError::NoConversation)?;
        let command = OutboundCommand::ChatMessage(ChatSendPayload {
            conversation_id: conversation_id.clone(),
            content: text.to_string(),
        });
        if !self.conn.send(command).await {
            return Err(SubmitError::NotConnected);
        }
        let user = self.ctx.auth.user();
        self.ctx.chat.add_message(ChatMessage::user(
            &conversation_id,
            user.as_ref().map(|u| u.id.as_str()),
            user.as_ref().map(|u| u.display_name.as_str()),
            text,
        ));
        Ok(())
    }

    pub async fn set_typing(&self, is_typing: bool) -> bool {
        self.conn
            .send(OutboundCommand::ChatTyping(TypingSendPayload { is_typing }))
            .await
    }

    /// Sends a queued prompt once connected, with an active conversation and
    /// an idle agent. Returns true when the prompt went out.
    pub async fn flush_pending_prompt(&self) -> bool {
        if !self.conn.status().is_open() {
            return false;
        }
        let ready = self.ctx.chat.read(|s| {
            s.pending_prompt.is_some() && s.conversation_id.is_some() && !s.is_agent_typing
        });
        if !ready {
            return false;
        }
        let Some(prompt) = self.ctx.chat.take_pending_prompt() else {
            return false;
        };
        match self.submit_prompt(&prompt, Vec::new()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "pending_prompt_failed", error = %err);
                false
            }
        }
    }

    /// Switches to `conversation_id` and loads its history. Switching to the
    /// active conversation is a no-op.
    pub async fn switch_conversation(&self, conversation_id: &str) -> Result<bool, ClientError> {
        if !self.ctx.chat.switch_conversation(conversation_id) {
            return Ok(false);
        }
        self.load_history(conversation_id).await?;
        Ok(true)
    }

    pub async fn load_history(&self, conversation_id: &str) -> Result<(), ClientError> {
        let messages = self.api.list_messages(conversation_id).await?;
        self.ctx.cache.put(
            QueryKey::messages(conversation_id),
            serde_json::to_value(&messages).unwrap_or_default(),
        );
        // The user may have switched again while the request was in flight.
        let still_active = self
            .ctx
            .chat
            .read(|s| s.conversation_id.as_deref() == Some(conversation_id));
        if still_active {
            self.ctx.chat.set_messages(messages);
        }
        Ok(())
    }

    pub async fn create_conversation(&self) -> Result<String, ClientError> {
        let convo = self.api.create_conversation(NEW_CONVERSATION_TITLE).await?;
        self.ctx.cache.invalidate_region(CacheRegion::Conversations);
        self.ctx.chat.switch_conversation(&convo.id);
        info!(event = "conversation_created", conversation_id = %convo.id);
        Ok(convo.id)
    }

    /// Picks the preferred conversation, else the most recent one, else
    /// creates a fresh one.
    pub async fn open_initial_conversation(&self, preferred: Option<&str>) -> Result<String, ClientError> {
        if let Some(id) = preferred {
            self.switch_conversation(id).await?;
            return Ok(id.to_string());
        }
        let conversations = self.api.list_conversations().await?;
        self.ctx.cache.put(
            QueryKey::region(CacheRegion::Conversations),
            serde_json::to_value(&conversations).unwrap_or_default(),
        );
        match conversations.first() {
            Some(convo) => {
                self.switch_conversation(&convo.id).await?;
                Ok(convo.id.clone())
            }
            None => self.create_conversation().await,
        }
    }
}

pub fn load_session_file(path: &Path) -> Result<Option<Session>, ClientError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ClientError::Session(err.to_string())),
    };
    let session: Session =
        serde_json::from_str(&raw).map_err(|err| ClientError::Session(err.to_string()))?;
    if session.access_token.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(session))
}

pub fn save_session_file(path: &Path, session: &Session) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| ClientError::Session(err.to_string()))?;
        }
    }
    let data =
        serde_json::to_string_pretty(session).map_err(|err| ClientError::Session(err.to_string()))?;
    std::fs::write(path, data).map_err(|err| ClientError::Session(err.to_string()))
}

pub fn clear_session_file(path: &Path) -> Result<(), ClientError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ClientError::Session(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionSettings;
    use drive_sync_core::ui::NOT_CONNECTED_NOTICE;
    use url::Url;

    fn session() -> ChatSession {
        let endpoint = Url::parse("ws://127.0.0.1:9/api/v1/ws/drive").expect("url");
        let conn = ConnectionManager::spawn(AppContext::shared(), ConnectionSettings::new(endpoint));
        let api = DriveApi::new("http://127.0.0.1:9/api/v1").expect("api");
        ChatSession::new(conn, api)
    }

    #[tokio::test]
    async fn submit_needs_a_conversation_and_an_idle_agent() {
        let session = session();
        assert_eq!(session.submit_prompt("  ", Vec::new()).await, Err(SubmitError::Empty));
        assert_eq!(
            session.submit_prompt("hi", Vec::new()).await,
            Err(SubmitError::NoConversation)
        );

        session.context().chat.switch_conversation("c1");
        session.context().chat.set_agent_typing(true);
        assert_eq!(session.submit_prompt("hi", Vec::new()).await, Err(SubmitError::Busy));
        assert!(session.context().chat.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn dropped_invoke_keeps_message_and_clears_working_flag() {
        let session = session();
        session.context().chat.switch_conversation("c1");
        assert_eq!(
            session.submit_prompt("hello", Vec::new()).await,
            Err(SubmitError::NotConnected)
        );
        let chat = session.context().chat.snapshot();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "hello");
        assert!(!chat.is_agent_typing);
        let notices = session.context().ui.snapshot().notices;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, NOT_CONNECTED_NOTICE);
        session.connection().teardown().await;
    }

    #[tokio::test]
    async fn pending_prompt_waits_for_an_open_link() {
        let session = session();
        session.context().chat.switch_conversation("c1");
        session.context().chat.set_pending_prompt(Some("queued".to_string()));
        assert!(!session.flush_pending_prompt().await);
        assert_eq!(
            session.context().chat.snapshot().pending_prompt.as_deref(),
            Some("queued")
        );
    }

    #[test]
    fn session_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("drive-sync-session-{}", std::process::id()));
        let path = dir.join("session.json");
        assert_eq!(load_session_file(&path).expect("missing is ok"), None);

        let saved = Session {
            access_token: "tok".to_string(),
            refresh_token: Some("ref".to_string()),
        };
        save_session_file(&path, &saved).expect("save");
        assert_eq!(load_session_file(&path).expect("load"), Some(saved));

        clear_session_file(&path).expect("clear");
        clear_session_file(&path).expect("clear twice");
        let _ = std::fs::remove_dir_all(dir);
    }
}
