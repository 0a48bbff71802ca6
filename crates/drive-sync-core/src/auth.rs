use crate::store::Store;
use crate::User;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub session: Option<Session>,
    pub user: Option<User>,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }
}

#[derive(Debug, Default)]
pub struct AuthStore {
    state: Store<AuthState>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AuthState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Current bearer token; empty tokens count as absent.
    pub fn access_token(&self) -> Option<String> {
        self.state.read(|s| {
            s.session
                .as_ref()
                .map(|session| session.access_token.trim().to_string())
                .filter(|token| !token.is_empty())
        })
    }

    pub fn user(&self) -> Option<User> {
        self.state.read(|s| s.user.clone())
    }

    pub fn login(&self, access_token: &str, refresh_token: Option<&str>) {
        self.state.mutate(|s| {
            s.session = Some(Session {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.map(str::to_string),
            });
            true
        });
    }

    pub fn restore(&self, session: Session) {
        self.state.mutate(|s| {
            s.session = Some(session);
            true
        });
    }

    pub fn set_user(&self, user: Option<User>) {
        self.state.mutate(|s| {
            s.user = user;
            true
        });
    }

    pub fn logout(&self) {
        self.state.replace(AuthState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tokens_are_not_sessions() {
        let auth = AuthStore::new();
        assert_eq!(auth.access_token(), None);
        auth.login("   ", None);
        assert_eq!(auth.access_token(), None);
        auth.login("tok-1", Some("ref-1"));
        assert_eq!(auth.access_token().as_deref(), Some("tok-1"));
        assert!(auth.snapshot().is_authenticated());
    }

    #[test]
    fn logout_clears_user_and_tokens() {
        let auth = AuthStore::new();
        auth.login("tok-1", None);
        auth.set_user(Some(User {
            id: "u1".to_string(),
            email: "ada@example.com".to_string(),
            display_name: "Ada".to_string(),
            has_api_key: true,
        }));
        auth.logout();
        let state = auth.snapshot();
        assert!(!state.is_authenticated());
        assert_eq!(state.user, None);
    }
}
