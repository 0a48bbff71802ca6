use crate::bridge::{self, BridgeOutcome};
use crate::context::AppContext;
use crate::protocol::{decode_event, InboundEvent, ToolUsePayload, DEFAULT_MAX_FRAME_BYTES};
use crate::ui::NoticeLevel;
use crate::{now_rfc3339, ToolCallStatus};
use std::sync::Arc;

/// Which handler consumed an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Transcript,
    StreamDelta,
    StreamEnd { stopped: bool },
    ToolStarted,
    ToolCompleted { matched: bool },
    Presence,
    Invalidation(BridgeOutcome),
    ServerError,
    Liveness,
    /// Well-formed frame of a type this client does not know.
    Ignored,
    /// Malformed or oversized frame; logged and discarded.
    Dropped,
}

/// Stateless dispatch from inbound events to the stores. Handlers always read
/// the live store state through the shared context.
#[derive(Debug, Clone)]
pub struct EventRouter {
    ctx: Arc<AppContext>,
    max_frame_bytes: usize,
}

impl EventRouter {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Decodes and dispatches one text frame. Never fails: bad frames are
    /// logged and dropped so the read loop keeps going.
    pub fn dispatch_text(&self, text: &str) -> Route {
        match decode_event(text, self.max_frame_bytes) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => {
                tracing::debug!(event = "ws_event_ignored", bytes = text.len());
                Route::Ignored
            }
            Err(err) => {
                tracing::warn!(event = "ws_frame_dropped", bytes = text.len(), error = %err);
                Route::Dropped
            }
        }
    }

    pub fn dispatch(&self, event: InboundEvent) -> Route {
        let ctx = &self.ctx;
        match event {
            InboundEvent::ChatMessage(mut msg) => {
                if msg.created_at.is_empty() {
                    msg.created_at = now_rfc3339();
                }
                ctx.chat.add_message(msg);
                Route::Transcript
            }
            InboundEvent::ChatTyping(p) => {
                ctx.chat.set_peer_typing(&p.user_id, &p.display_name, p.is_typing);
                Route::Presence
            }
            InboundEvent::StreamDelta(p) => {
                ctx.chat.append_delta(&p.delta);
                Route::StreamDelta
            }
            InboundEvent::StreamEnd(p) => {
                ctx.chat.finalize(&p.content, p.conversation_id.as_deref());
                Route::StreamEnd { stopped: p.stopped }
            }
            InboundEvent::ToolUse(p) => self.tool_use(&p),
            InboundEvent::Error(p) => {
                tracing::warn!(event = "server_error", message = %p.message);
                ctx.ui.push_notice(NoticeLevel::Error, &p.message);
                ctx.chat.abandon_turn();
                Route::ServerError
            }
            InboundEvent::Pong => {
                tracing::debug!(event = "pong");
                Route::Liveness
            }
            other => match other.mutation() {
                Some(mutation) => {
                    let outcome = bridge::apply(&ctx.cache, &ctx.drive, &mutation);
                    tracing::debug!(
                        event = "cache_invalidated",
                        mutation = %mutation,
                        keys = outcome.invalidated.len()
                    );
                    Route::Invalidation(outcome)
                }
                None => Route::Ignored,
            },
        }
    }

    fn tool_use(&self, p: &ToolUsePayload) -> Route {
        let label = p.effective_label();
        match ToolCallStatus::from_wire(&p.status) {
            ToolCallStatus::Started => {
                self.ctx
                    .chat
                    .add_tool_call(&p.tool_name, label, p.call_id.as_deref());
                Route::ToolStarted
            }
            ToolCallStatus::Completed => {
                let matched = self.ctx.chat.complete_tool_call(
                    &p.tool_name,
                    label,
                    p.result.as_deref(),
                    p.call_id.as_deref(),
                );
                if !matched {
                    tracing::debug!(event = "tool_completion_unmatched", tool = %p.tool_name, label);
                }
                Route::ToolCompleted { matched }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRegion, QueryKey};
    use serde_json::json;

    fn router() -> EventRouter {
        EventRouter::new(AppContext::shared())
    }

    #[test]
    fn streaming_scenario_ends_with_exact_content() {
        let router = router();
        for delta in ["Hel", "lo ", "world"] {
            let frame = json!({"type": "agent.stream_delta", "payload": {"delta": delta}});
            assert_eq!(router.dispatch_text(&frame.to_string()), Route::StreamDelta);
        }
        assert_eq!(router.context().chat.snapshot().streaming_content, "Hello world");

        let end = json!({"type": "agent.stream_end", "payload": {"content": "Hello world", "conversation_id": "c1"}});
        assert_eq!(router.dispatch_text(&end.to_string()), Route::StreamEnd { stopped: false });

        let state = router.context().chat.snapshot();
        assert_eq!(state.streaming_content, "");
        assert!(!state.is_agent_typing);
        assert_eq!(state.last_message().map(|m| m.content.as_str()), Some("Hello world"));
    }

    #[test]
    fn tool_use_started_then_completed() {
        let router = router();
        let started = json!({"type": "agent.tool_use", "payload": {"tool_name": "read_file", "label": "Reading file", "status": "started"}});
        assert_eq!(router.dispatch_text(&started.to_string()), Route::ToolStarted);
        assert_eq!(
            router.context().chat.snapshot().active_tool_call.as_deref(),
            Some("read_file")
        );

        let done = json!({"type": "agent.tool_use", "payload": {"tool_name": "read_file", "label": "Reading file", "status": "done", "result": "ok"}});
        assert_eq!(router.dispatch_text(&done.to_string()), Route::ToolCompleted { matched: true });
        let state = router.context().chat.snapshot();
        assert_eq!(state.tool_history[0].status, ToolCallStatus::Completed);
        assert_eq!(state.active_tool_call, None);

        let orphan = json!({"type": "agent.tool_use", "payload": {"tool_name": "grep", "status": "completed"}});
        assert_eq!(router.dispatch_text(&orphan.to_string()), Route::ToolCompleted { matched: false });
    }

    #[test]
    fn server_error_raises_notice_and_abandons_turn() {
        let router = router();
        router.context().chat.append_delta("thinking");
        let frame = json!({"type": "error", "payload": {"message": "quota exceeded"}});
        assert_eq!(router.dispatch_text(&frame.to_string()), Route::ServerError);

        let chat = router.context().chat.snapshot();
        assert!(!chat.is_agent_typing);
        assert!(chat.messages.is_empty());
        let notices = router.context().ui.snapshot().notices;
        assert_eq!(notices.back().map(|n| n.message.as_str()), Some("quota exceeded"));
        assert_eq!(notices.back().map(|n| n.level), Some(NoticeLevel::Error));
    }

    #[test]
    fn malformed_and_unknown_frames_do_not_touch_state() {
        let router = router();
        assert_eq!(router.dispatch_text("{not json"), Route::Dropped);
        assert_eq!(
            router.dispatch_text(r#"{"type":"agent.stream_delta","payload":{}}"#),
            Route::Dropped
        );
        assert_eq!(router.dispatch_text(r#"{"type":"presence.join"}"#), Route::Ignored);
        assert_eq!(router.dispatch_text(r#"{"type":"pong"}"#), Route::Liveness);

        let small = EventRouter::new(AppContext::shared()).with_max_frame_bytes(8);
        assert_eq!(small.dispatch_text(r#"{"type":"pong"}"#), Route::Dropped);
        assert_eq!(router.context().chat.snapshot().messages.len(), 0);
    }

    #[test]
    fn chat_messages_are_appended_with_a_timestamp() {
        let router = router();
        let frame = json!({"type": "chat.message", "payload": {"conversation_id": "c1", "sender_type": "user", "sender_id": "u2", "content": "hey"}});
        assert_eq!(router.dispatch_text(&frame.to_string()), Route::Transcript);
        let last = router.context().chat.snapshot().messages.pop().expect("message");
        assert_eq!(last.content, "hey");
        assert!(!last.created_at.is_empty());
    }

    #[test]
    fn typing_peers_follow_presence_events() {
        let router = router();
        let on = json!({"type": "chat.typing", "payload": {"user_id": "u2", "display_name": "Grace", "is_typing": true}});
        router.dispatch_text(&on.to_string());
        assert_eq!(
            router.context().chat.snapshot().typing_peers.get("u2").map(String::as_str),
            Some("Grace")
        );
        let off = json!({"type": "chat.typing", "payload": {"user_id": "u2", "is_typing": false}});
        router.dispatch_text(&off.to_string());
        assert!(router.context().chat.snapshot().typing_peers.is_empty());
    }

    #[test]
    fn file_deleted_for_selected_file_clears_selection() {
        let router = router();
        let ctx = router.context();
        ctx.drive.select_file("f1", "plan.md", None);
        ctx.cache.put(QueryKey::region(CacheRegion::RecentFiles), json!([]));

        let other = json!({"type": "file.deleted", "payload": {"file_id": "f2"}});
        router.dispatch_text(&other.to_string());
        assert_eq!(ctx.drive.selected_file_id().as_deref(), Some("f1"));
        assert!(ctx.cache.is_stale(&QueryKey::region(CacheRegion::RecentFiles)));

        let mine = json!({"type": "file.deleted", "payload": {"file_id": "f1"}});
        let Route::Invalidation(outcome) = router.dispatch_text(&mine.to_string()) else {
            panic!("expected invalidation")
        };
        assert!(outcome.cleared_selection);
        assert_eq!(ctx.drive.selected_file_id(), None);
    }
}
