//! Server half of the drive realtime protocol, for local runs: token check,
//! liveness, chat fan-out, scripted agent turns and mutation fan-out.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use drive_sync_core::protocol::{
    decode_command, decode_event, encode_frame, AgentInvokePayload, ErrorPayload, InboundEvent,
    OutboundCommand, StreamDeltaPayload, StreamEndPayload, ToolUsePayload, TypingPayload,
    AUTH_FAILURE_CLOSE_CODE, DEFAULT_MAX_FRAME_BYTES,
};
use drive_sync_core::{now_rfc3339, ChatMessage, SenderType};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const WS_PATH: &str = "/api/v1/ws/drive";
pub const EVENTS_PATH: &str = "/api/v1/events";
pub const STOPPED_CONTENT: &str = "(Stopped)";

/// A token the hub accepts, with the display name its connections carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedToken {
    pub token: String,
    pub display_name: String,
}

impl AcceptedToken {
    /// Parses `TOKEN` or `TOKEN:NAME`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (token, name) = match raw.split_once(':') {
            Some((token, name)) => (token.trim(), name.trim()),
            None => (raw.trim(), ""),
        };
        if token.is_empty() {
            return None;
        }
        let display_name = if name.is_empty() { token } else { name };
        Some(Self {
            token: token.to_string(),
            display_name: display_name.to_string(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Empty means any non-empty token is accepted as a guest.
    pub tokens: Vec<AcceptedToken>,
    pub word_delay: Duration,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            word_delay: Duration::from_millis(40),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Identity {
    user_id: String,
    display_name: String,
}

struct Client {
    conn_id: String,
    identity: Identity,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_event(&self, event: &InboundEvent) -> bool {
        let text = match encode_frame(event, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", kind = event.kind(), error = %err);
                return false;
            }
        };
        self.sender.send(Message::Text(text)).await.is_ok()
    }
}

struct Turn {
    id: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    msg_counter: AtomicU64,
    turn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    turns: AsyncMutex<HashMap<String, Turn>>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(EVENTS_PATH, post(events_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, query.token, addr).await;
    })
}

async fn events_handler(State(hub): State<Arc<HubState>>, body: String) -> impl IntoResponse {
    match hub.publish_mutation(&body).await {
        Ok(delivered) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "delivered": delivered })),
        )
            .into_response(),
        Err(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
    }
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            msg_counter: AtomicU64::new(0),
            turn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            turns: AsyncMutex::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn next_message_id(&self) -> String {
        let id = self.msg_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("msg-{id}")
    }

    fn authenticate(&self, token: Option<&str>) -> Result<Identity, &'static str> {
        let token = match token.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err("Missing token"),
        };
        let display_name = if self.config.tokens.is_empty() {
            "guest".to_string()
        } else {
            self.config
                .tokens
                .iter()
                .find(|accepted| accepted.token == token)
                .map(|accepted| accepted.display_name.clone())
                .ok_or("Invalid token")?
        };
        Ok(Identity {
            user_id: format!("user-{}", display_name.to_ascii_lowercase()),
            display_name,
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            user_id = %client.identity.user_id
        );
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        self.clients.write().await.remove(&client.conn_id);
        let remaining = self.connection_count().await;
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            reason = reason,
            remaining
        );
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Sends to every connection except `skip`; returns how many accepted it.
    async fn broadcast(&self, event: &InboundEvent, skip: Option<&str>) -> usize {
        let mut delivered = 0;
        for client in self.snapshot_clients().await {
            if skip == Some(client.conn_id.as_str()) {
                continue;
            }
            if client.send_event(event).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id, kind = event.kind());
                self.remove_client(&client, "send_error").await;
            }
        }
        delivered
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, token: Option<String>, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let identity = match self.authenticate(token.as_deref()) {
            Ok(identity) => identity,
            Err(reason) => {
                warn!(event = "auth_rejected", remote = %remote, reason = reason);
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: AUTH_FAILURE_CLOSE_CODE,
                        reason: reason.into(),
                    })))
                    .await;
                drop(tx);
                let _ = write_task.await;
                return;
            }
        };

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            identity,
            sender: tx.clone(),
        });
        self.register_client(client.clone()).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            self.handle_message(&client, &text).await;
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }

    async fn handle_message(self: &Arc<Self>, client: &Client, text: &str) {
        let command = match decode_command(text, DEFAULT_MAX_FRAME_BYTES) {
            Ok(Some(command)) => command,
            Ok(None) => {
                warn!(event = "unknown_message", conn_id = %client.conn_id);
                return;
            }
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                return;
            }
        };
        debug!(event = "message_received", conn_id = %client.conn_id, kind = command.kind());
        match command {
            OutboundCommand::Ping => {
                client.send_event(&InboundEvent::Pong).await;
            }
            OutboundCommand::ChatMessage(payload) => {
                if payload.content.trim().is_empty() {
                    return;
                }
                let msg = self.user_message(client, &payload.conversation_id, &payload.content);
                self.broadcast(&InboundEvent::ChatMessage(msg), Some(client.conn_id.as_str()))
                    .await;
            }
            OutboundCommand::ChatTyping(payload) => {
                let typing = InboundEvent::ChatTyping(TypingPayload {
                    user_id: client.identity.user_id.clone(),
                    display_name: client.identity.display_name.clone(),
                    is_typing: payload.is_typing,
                });
                self.broadcast(&typing, Some(client.conn_id.as_str())).await;
            }
            OutboundCommand::AgentInvoke(payload) => self.invoke(client, payload).await,
            OutboundCommand::AgentStop(payload) => {
                if !self.cancel_turn(&payload.conversation_id).await {
                    debug!(event = "stop_without_turn", conversation_id = %payload.conversation_id);
                }
            }
        }
    }

    fn user_message(&self, client: &Client, conversation_id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: Some(self.next_message_id()),
            conversation_id: conversation_id.to_string(),
            sender_type: SenderType::User,
            sender_id: Some(client.identity.user_id.clone()),
            sender_name: Some(client.identity.display_name.clone()),
            content: content.to_string(),
            created_at: now_rfc3339(),
            is_streaming: false,
        }
    }

    async fn invoke(self: &Arc<Self>, client: &Client, payload: AgentInvokePayload) {
        let msg = self.user_message(client, &payload.conversation_id, &payload.message);
        self.broadcast(&InboundEvent::ChatMessage(msg), Some(client.conn_id.as_str()))
            .await;

        let conversation_id = payload.conversation_id;
        let mut turns = self.turns.lock().await;
        // A new prompt replaces the running turn; it starts once the old one
        // has announced its stop.
        let previous = turns.remove(&conversation_id).map(|turn| {
            let _ = turn.cancel.send(());
            turn.handle
        });
        let id = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancelled) = oneshot::channel();
        let hub = self.clone();
        let conv = conversation_id.clone();
        let prompt = payload.message;
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            info!(event = "turn_started", conversation_id = %conv, turn = id);
            let stopped = tokio::select! {
                _ = hub.run_script(&conv, &prompt, id) => false,
                _ = cancelled => true,
            };
            if stopped {
                let end = InboundEvent::StreamEnd(StreamEndPayload {
                    content: STOPPED_CONTENT.to_string(),
                    conversation_id: Some(conv.clone()),
                    stopped: true,
                });
                hub.broadcast(&end, None).await;
                info!(event = "turn_stopped", conversation_id = %conv, turn = id);
            }
            hub.finish_turn(&conv, id).await;
        });
        turns.insert(conversation_id, Turn { id, cancel, handle });
    }

    async fn finish_turn(&self, conversation_id: &str, id: u64) {
        let mut turns = self.turns.lock().await;
        if turns.get(conversation_id).map(|turn| turn.id) == Some(id) {
            turns.remove(conversation_id);
        }
    }

    async fn cancel_turn(&self, conversation_id: &str) -> bool {
        match self.turns.lock().await.remove(conversation_id) {
            Some(turn) => turn.cancel.send(()).is_ok(),
            None => false,
        }
    }

    /// Deterministic stand-in for an agent: one tool call, then the reply
    /// streamed word by word.
    async fn run_script(&self, conversation_id: &str, prompt: &str, turn: u64) {
        let delay = self.config.word_delay;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            let error = InboundEvent::Error(ErrorPayload {
                message: "Agent error: empty prompt".to_string(),
            });
            self.broadcast(&error, None).await;
            return;
        }

        let call_id = format!("call-{turn}");
        let tool = |status: &str, result: Option<String>| {
            InboundEvent::ToolUse(ToolUsePayload {
                tool_name: "search_files".to_string(),
                label: Some("Searching files".to_string()),
                status: status.to_string(),
                result,
                call_id: Some(call_id.clone()),
                conversation_id: Some(conversation_id.to_string()),
            })
        };
        self.broadcast(&tool("started", None), None).await;
        tokio::time::sleep(delay).await;
        self.broadcast(&tool("completed", Some("0 matches".to_string())), None)
            .await;

        let reply = format!("You asked: {prompt}");
        for word in reply.split_inclusive(' ') {
            tokio::time::sleep(delay).await;
            let delta = InboundEvent::StreamDelta(StreamDeltaPayload {
                delta: word.to_string(),
                conversation_id: Some(conversation_id.to_string()),
            });
            self.broadcast(&delta, None).await;
        }
        let end = InboundEvent::StreamEnd(StreamEndPayload {
            content: reply,
            conversation_id: Some(conversation_id.to_string()),
            stopped: false,
        });
        self.broadcast(&end, None).await;
    }

    /// Fans a file/folder mutation notice out to every connection.
    pub async fn publish_mutation(&self, body: &str) -> Result<usize, String> {
        let event = match decode_event(body, DEFAULT_MAX_FRAME_BYTES) {
            Ok(Some(event)) => event,
            Ok(None) => return Err("unknown event type".to_string()),
            Err(err) => return Err(err.to_string()),
        };
        let Some(mutation) = event.mutation() else {
            return Err(format!("{} is not a mutation notice", event.kind()));
        };
        let delivered = self.broadcast(&event, None).await;
        info!(event = "mutation_published", mutation = %mutation, delivered);
        Ok(delivered)
    }
}
