use crate::store::Store;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;

const MAX_NOTICES: usize = 16;

pub const NOT_CONNECTED_NOTICE: &str = "Not connected to server. Reconnecting...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
}

/// Banner shown for the realtime link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionBanner {
    #[default]
    Offline,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    AuthRejected,
}

impl ConnectionBanner {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionBanner::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    pub chat_panel_open: bool,
    pub sidebar_open: bool,
    pub connection: ConnectionBanner,
    pub notices: VecDeque<Notice>,
    next_notice_id: u64,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            chat_panel_open: true,
            sidebar_open: true,
            connection: ConnectionBanner::Offline,
            notices: VecDeque::new(),
            next_notice_id: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct UiStore {
    state: Store<UiState>,
}

impl UiStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UiState {
        self.state.snapshot()
    }

    pub fn read<R>(&self, f: impl FnOnce(&UiState) -> R) -> R {
        self.state.read(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.state.subscribe()
    }

    pub fn toggle_chat_panel(&self) {
        self.state.mutate(|s| {
            s.chat_panel_open = !s.chat_panel_open;
            true
        });
    }

    pub fn toggle_sidebar(&self) {
        self.state.mutate(|s| {
            s.sidebar_open = !s.sidebar_open;
            true
        });
    }

    pub fn set_chat_panel_open(&self, open: bool) {
        self.state.mutate(|s| {
            if s.chat_panel_open == open {
                return false;
            }
            s.chat_panel_open = open;
            true
        });
    }

    pub fn set_connection(&self, banner: ConnectionBanner) {
        self.state.mutate(|s| {
            if s.connection == banner {
                return false;
            }
            s.connection = banner;
            true
        });
    }

    /// Queues a toast; the oldest is evicted once the queue is full.
    pub fn push_notice(&self, level: NoticeLevel, message: &str) -> u64 {
        let mut id = 0;
        self.state.mutate(|s| {
            id = s.next_notice_id;
            s.next_notice_id += 1;
            if s.notices.len() == MAX_NOTICES {
                s.notices.pop_front();
            }
            s.notices.push_back(Notice {
                id,
                level,
                message: message.to_string(),
            });
            true
        });
        id
    }

    pub fn dismiss_notice(&self, id: u64) -> bool {
        self.state.mutate(|s| {
            let before = s.notices.len();
            s.notices.retain(|n| n.id != id);
            s.notices.len() != before
        })
    }

    pub fn reset(&self) {
        self.state.replace(UiState::default());
    }
}
