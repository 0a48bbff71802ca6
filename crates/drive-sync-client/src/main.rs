use clap::Parser;
use drive_sync_client::config::{load_config, Args, RuntimeConfig};
use drive_sync_client::logging::init_logging;
use drive_sync_client::manager::{ConnectionManager, ConnectionSettings};
use drive_sync_client::rest::DriveApi;
use drive_sync_client::session::{
    clear_session_file, load_session_file, save_session_file, ChatSession, SubmitError,
};
use drive_sync_client::ClientError;
use drive_sync_core::auth::Session;
use drive_sync_core::chat::ChatState;
use drive_sync_core::context::AppContext;
use drive_sync_core::drive::DriveState;
use drive_sync_core::ui::{ConnectionBanner, NoticeLevel, UiState};
use drive_sync_core::{ChatMessage, SenderType, ToolCallStatus, User};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match load_config(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("drive-sync: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config.log_dir, "drive-sync", config.log_stdout);

    let ctx = AppContext::shared();
    let api = match authenticate(&config, &ctx).await {
        Ok(api) => api,
        Err(err) => {
            error!(event = "auth_failed", error = %err);
            eprintln!("drive-sync: sign-in failed: {err}");
            std::process::exit(1);
        }
    };

    let endpoint = match config.ws_endpoint() {
        Ok(endpoint) => endpoint,
        Err(err) => {
            eprintln!("drive-sync: {err}");
            std::process::exit(2);
        }
    };
    let mut settings = ConnectionSettings::new(endpoint);
    settings.heartbeat_interval = config.heartbeat_interval;
    settings.reconnect = config.reconnect;
    let conn = ConnectionManager::spawn(ctx.clone(), settings);
    conn.connect();

    let session = ChatSession::new(conn.clone(), api);
    let mut view = Renderer::new(ctx.auth.user());
    match session
        .open_initial_conversation(config.conversation.as_deref())
        .await
    {
        Ok(id) => view.history(&id, &ctx.chat.snapshot()),
        Err(err) => {
            warn!(event = "conversation_load_failed", error = %err);
            eprintln!("! could not load conversations: {err}");
        }
    }

    let code = run(&session, &mut view, &config).await;
    conn.teardown().await;
    info!(event = "shutdown");
    std::process::exit(code);
}

async fn authenticate(config: &RuntimeConfig, ctx: &Arc<AppContext>) -> Result<DriveApi, ClientError> {
    let mut api = DriveApi::new(&config.rest_base())?;
    let mut from_file = false;
    if let Some(token) = config.token.as_deref() {
        ctx.auth.login(token, None);
    } else if let Some(session) = load_session_file(&config.session_file)? {
        ctx.auth.restore(session);
        from_file = true;
    } else {
        login_with_password(config, ctx, &api).await?;
    }

    api.set_token(ctx.auth.access_token());
    let user = match api.me().await {
        Ok(user) => user,
        Err(ClientError::Unauthorized) if from_file => {
            // Stored session expired; fall back to credentials if we have them.
            clear_session_file(&config.session_file)?;
            ctx.auth.logout();
            login_with_password(config, ctx, &api).await?;
            api.set_token(ctx.auth.access_token());
            api.me().await?
        }
        Err(err) => return Err(err),
    };
    info!(event = "signed_in", user_id = %user.id);
    ctx.auth.set_user(Some(user));
    Ok(api)
}

async fn login_with_password(
    config: &RuntimeConfig,
    ctx: &Arc<AppContext>,
    api: &DriveApi,
) -> Result<(), ClientError> {
    let (Some(email), Some(password)) = (config.email.as_deref(), config.password.as_deref()) else {
        return Err(ClientError::Config(
            "no session: pass --token or --email and --password".to_string(),
        ));
    };
    let pair = api.login(email, password).await?;
    ctx.auth.login(&pair.access_token, pair.refresh_token.as_deref());
    save_session_file(
        &config.session_file,
        &Session {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        },
    )
}

async fn run(session: &ChatSession, view: &mut Renderer, config: &RuntimeConfig) -> i32 {
    let ctx = session.context().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut chat_rx = ctx.chat.subscribe();
    let mut ui_rx = ctx.ui.subscribe();
    let mut drive_rx = ctx.drive.subscribe();
    let mut status_rx = session.connection().subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(session, view, config, line.trim()).await {
                        return 0;
                    }
                }
                Ok(None) => return 0,
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    return 1;
                }
            },
            changed = chat_rx.changed() => {
                if changed.is_err() {
                    return 1;
                }
                let state = chat_rx.borrow_and_update().clone();
                view.chat(&state);
            }
            changed = ui_rx.changed() => {
                if changed.is_err() {
                    return 1;
                }
                let state = ui_rx.borrow_and_update().clone();
                view.ui(&state);
            }
            changed = drive_rx.changed() => {
                if changed.is_err() {
                    return 1;
                }
                let state = drive_rx.borrow_and_update().clone();
                view.drive(&state);
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return 1;
                }
                let open = status_rx.borrow_and_update().is_open();
                if open {
                    session.flush_pending_prompt().await;
                }
            }
            _ = tokio::signal::ctrl_c() => return 130,
        }
    }
}

/// Returns false when the client should exit.
async fn handle_line(session: &ChatSession, view: &mut Renderer, config: &RuntimeConfig, line: &str) -> bool {
    let ctx = session.context();
    if line.is_empty() {
        return true;
    }
    let (command, rest) = match line.strip_prefix('/') {
        Some(cmd) => cmd.split_once(' ').unwrap_or((cmd, "")),
        None => ("", line),
    };
    let rest = rest.trim();
    match command {
        "quit" | "exit" => return false,
        "stop" => report(session.stop().await),
        "say" => report(session.say(rest).await),
        "typing" => {
            session.set_typing(rest != "off").await;
        }
        "conv" => match session.switch_conversation(rest).await {
            Ok(true) => view.history(rest, &ctx.chat.snapshot()),
            Ok(false) => {}
            Err(err) => eprintln!("! {err}"),
        },
        "new" => match session.create_conversation().await {
            Ok(id) => view.history(&id, &ctx.chat.snapshot()),
            Err(err) => eprintln!("! {err}"),
        },
        "open" => {
            let (id, name) = rest.split_once(' ').unwrap_or((rest, rest));
            if id.is_empty() {
                eprintln!("! usage: /open <file-id> <name>");
            } else {
                ctx.drive.select_file(id, name.trim(), None);
            }
        }
        "close" => ctx.drive.clear_selected_file(),
        "logout" => {
            if let Err(err) = clear_session_file(&config.session_file) {
                warn!(event = "session_clear_failed", error = %err);
            }
            session.connection().disconnect();
            ctx.reset();
            return false;
        }
        "" => {
            if session.connection().status().is_open() {
                report(session.submit_prompt(line, Vec::new()).await);
            } else {
                ctx.chat.set_pending_prompt(Some(line.to_string()));
                println!("(offline: prompt queued until the connection returns)");
            }
        }
        other => eprintln!("! unknown command /{other}"),
    }
    true
}

fn report(result: Result<(), SubmitError>) {
    match result {
        Ok(()) => {}
        // The connection manager already raised a notice.
        Err(SubmitError::NotConnected) => {}
        Err(err) => eprintln!("! {err}"),
    }
}

/// Line-oriented view over the stores: prints streamed text as it arrives and
/// everything else as whole lines.
struct Renderer {
    me: Option<User>,
    seen_messages: usize,
    /// Streamed text already written for the current turn.
    printed: String,
    tools: Vec<(String, ToolCallStatus)>,
    last_notice: u64,
    banner: ConnectionBanner,
    selected: Option<String>,
    peers_typing: Vec<String>,
}

impl Renderer {
    fn new(me: Option<User>) -> Self {
        Self {
            me,
            seen_messages: 0,
            printed: String::new(),
            tools: Vec::new(),
            last_notice: 0,
            banner: ConnectionBanner::Offline,
            selected: None,
            peers_typing: Vec::new(),
        }
    }

    fn history(&mut self, conversation_id: &str, state: &ChatState) {
        println!("== conversation {conversation_id} ==");
        for msg in &state.messages {
            println!("{}", self.line(msg));
        }
        self.seen_messages = state.messages.len();
        self.printed.clear();
        self.tools.clear();
    }

    fn line(&self, msg: &ChatMessage) -> String {
        let who = match msg.sender_type {
            SenderType::Assistant => "assistant",
            SenderType::System => "system",
            SenderType::User => msg.sender_name.as_deref().unwrap_or("user"),
        };
        format!("{who}> {}", msg.content)
    }

    fn is_mine(&self, msg: &ChatMessage) -> bool {
        match (&self.me, msg.sender_id.as_deref()) {
            (Some(me), Some(id)) => me.id == id,
            (_, None) => msg.sender_type == SenderType::User,
            _ => false,
        }
    }

    fn chat(&mut self, state: &ChatState) {
        let mut out = io::stdout().lock();
        self.render_chat(state, &mut out);
        let _ = out.flush();
    }

    fn render_chat(&mut self, state: &ChatState, out: &mut impl Write) {
        for (index, tool) in state.tool_history.iter().enumerate() {
            let changed = self
                .tools
                .get(index)
                .map_or(true, |(label, status)| label != &tool.label || *status != tool.status);
            if changed {
                let _ = writeln!(out, "  [{}] {}", tool.status, tool.label);
            }
        }
        self.tools = state
            .tool_history
            .iter()
            .map(|tool| (tool.label.clone(), tool.status))
            .collect();

        // Messages first: one wake may carry a finalized turn and the next
        // turn's deltas together.
        if state.messages.len() < self.seen_messages {
            self.seen_messages = 0;
        }
        for msg in state.messages.get(self.seen_messages..).unwrap_or(&[]) {
            if msg.sender_type == SenderType::Assistant && !self.printed.is_empty() {
                let rest = msg.content.strip_prefix(self.printed.as_str()).unwrap_or("");
                let _ = writeln!(out, "{rest}");
                self.printed.clear();
            } else if !self.is_mine(msg) {
                let _ = writeln!(out, "{}", self.line(msg));
            }
        }
        self.seen_messages = state.messages.len();

        let buffer = &state.streaming_content;
        if !buffer.starts_with(self.printed.as_str()) {
            let _ = writeln!(out);
            self.printed.clear();
        }
        if let Some(fresh) = buffer.get(self.printed.len()..).filter(|s| !s.is_empty()) {
            if self.printed.is_empty() {
                let _ = write!(out, "assistant> ");
            }
            let _ = write!(out, "{fresh}");
            self.printed.clone_from(buffer);
        }

        let typing: Vec<String> = state.typing_peers.values().cloned().collect();
        if typing != self.peers_typing && !typing.is_empty() {
            let _ = writeln!(out, "  ({} typing)", typing.join(", "));
        }
        self.peers_typing = typing;
    }

    fn ui(&mut self, state: &UiState) {
        let mut out = io::stderr().lock();
        self.render_ui(state, &mut out);
    }

    fn render_ui(&mut self, state: &UiState, out: &mut impl Write) {
        if state.connection != self.banner {
            self.banner = state.connection;
            let _ = match state.connection {
                ConnectionBanner::Offline => writeln!(out, "[offline]"),
                ConnectionBanner::Connecting => writeln!(out, "[connecting]"),
                ConnectionBanner::Connected => writeln!(out, "[connected]"),
                ConnectionBanner::Reconnecting { attempt, delay } => writeln!(
                    out,
                    "[reconnecting in {}ms, attempt {attempt}]",
                    delay.as_millis()
                ),
                ConnectionBanner::AuthRejected => writeln!(out, "[session rejected]"),
            };
        }
        let seen = self.last_notice;
        for notice in state.notices.iter().filter(|n| n.id > seen) {
            let tag = match notice.level {
                NoticeLevel::Info => "i",
                NoticeLevel::Warning => "!",
                NoticeLevel::Error => "!!",
            };
            let _ = writeln!(out, "{tag} {}", notice.message);
            self.last_notice = notice.id;
        }
    }

    fn drive(&mut self, state: &DriveState) {
        let current = state.selected_file.as_ref().map(|f| f.id.clone());
        if current == self.selected {
            return;
        }
        match &state.selected_file {
            Some(file) => println!("(viewing {} as {})", file.name, state.view_mode),
            None => {
                if let Some(previous) = &self.selected {
                    println!("(closed {previous})");
                }
            }
        }
        self.selected = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_sync_core::ui::Notice;

    fn render(view: &mut Renderer, state: &ChatState) -> String {
        let mut out = Vec::new();
        view.render_chat(state, &mut out);
        String::from_utf8(out).expect("utf8 output")
    }

    fn streaming(messages: Vec<ChatMessage>, buffer: &str) -> ChatState {
        ChatState {
            conversation_id: Some("c1".to_string()),
            messages,
            is_agent_typing: !buffer.is_empty(),
            streaming_content: buffer.to_string(),
            ..ChatState::default()
        }
    }

    #[test]
    fn deltas_print_only_the_new_suffix() {
        let mut view = Renderer::new(None);
        assert_eq!(render(&mut view, &streaming(Vec::new(), "Hel")), "assistant> Hel");
        assert_eq!(render(&mut view, &streaming(Vec::new(), "Hello")), "lo");

        let done = vec![ChatMessage::assistant("c1", "Hello!")];
        assert_eq!(render(&mut view, &streaming(done, "")), "!\n");
    }

    #[test]
    fn coalesced_finalize_and_next_turn_start_cleanly() {
        let mut view = Renderer::new(None);
        render(&mut view, &streaming(Vec::new(), "abc"));

        let done = vec![ChatMessage::assistant("c1", "abc")];
        let out = render(&mut view, &streaming(done, "éé"));
        assert_eq!(out, "\nassistant> éé");
    }

    #[test]
    fn abandoned_turn_ends_the_line() {
        let mut view = Renderer::new(None);
        render(&mut view, &streaming(Vec::new(), "partial"));
        assert_eq!(render(&mut view, &streaming(Vec::new(), "")), "\n");
        assert_eq!(render(&mut view, &streaming(Vec::new(), "x")), "assistant> x");
    }

    #[test]
    fn system_and_peer_messages_print_whole() {
        let me = User {
            id: "u1".to_string(),
            email: "me@example.com".to_string(),
            display_name: "Me".to_string(),
            has_api_key: false,
        };
        let mut view = Renderer::new(Some(me));
        let mut system = ChatMessage::assistant("c1", "maintenance at noon");
        system.sender_type = SenderType::System;
        let messages = vec![
            ChatMessage::user("c1", Some("u1"), Some("Me"), "mine"),
            ChatMessage::user("c1", Some("u2"), Some("Bo"), "hi"),
            system,
        ];
        let out = render(&mut view, &streaming(messages, ""));
        assert_eq!(out, "Bo> hi\nsystem> maintenance at noon\n");
    }

    #[test]
    fn notices_print_once() {
        let mut view = Renderer::new(None);
        let mut state = UiState::default();
        state.notices.push_back(Notice {
            id: 1,
            level: NoticeLevel::Warning,
            message: "first".to_string(),
        });

        let mut out = Vec::new();
        view.render_ui(&state, &mut out);
        state.notices.push_back(Notice {
            id: 2,
            level: NoticeLevel::Error,
            message: "second".to_string(),
        });
        view.render_ui(&state, &mut out);
        assert_eq!(String::from_utf8(out).expect("utf8 output"), "! first\n!! second\n");
    }
}
