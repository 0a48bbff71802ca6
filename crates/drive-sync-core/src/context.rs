use crate::auth::AuthStore;
use crate::cache::QueryCache;
use crate::chat::ChatStore;
use crate::drive::DriveStore;
use crate::ui::UiStore;
use std::sync::Arc;

/// Every store the realtime layer reads or writes, handed to the connection
/// manager and the router at construction time.
#[derive(Debug, Default)]
pub struct AppContext {
    pub auth: AuthStore,
    pub chat: ChatStore,
    pub drive: DriveStore,
    pub ui: UiStore,
    pub cache: QueryCache,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Logout: drops the session and every piece of per-user state.
    pub fn reset(&self) {
        self.auth.logout();
        self.chat.reset();
        self.drive.reset();
        self.ui.reset();
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_user_state() {
        let ctx = AppContext::new();
        ctx.auth.login("tok", None);
        ctx.chat.switch_conversation("c1");
        ctx.drive.select_file("f1", "a.md", None);
        ctx.reset();
        assert_eq!(ctx.auth.access_token(), None);
        assert_eq!(ctx.chat.snapshot().conversation_id, None);
        assert_eq!(ctx.drive.selected_file_id(), None);
    }
}
