//! Authenticated session state shared between the orchestrator and the
//! remote adapters.

use std::sync::RwLock;

/// Bearer token and user identity for the current session.
///
/// A `401` from either remote clears the token via [`AuthSession::invalidate`];
/// queued work stays queued and is retried after re-authentication.
#[derive(Debug, Default)]
pub struct AuthSession {
    inner: RwLock<SessionState>,
}

#[derive(Debug, Default, Clone)]
struct SessionState {
    token: Option<String>,
    user_id: Option<String>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store credentials after a successful login.
    pub fn set_credentials(&self, token: impl Into<String>, user_id: impl Into<String>) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.token = Some(token.into());
        state.user_id = Some(user_id.into());
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .token
            .clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_id
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .token
            .is_some()
    }

    /// Drop the token. The user id is kept so a re-login can resume
    /// user-scoped work without re-deriving it.
    pub fn invalidate(&self) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_clears_token_but_keeps_user_id() {
        let session = AuthSession::new();
        session.set_credentials("tok", "user-1");
        assert!(session.is_authenticated());

        session.invalidate();
        assert!(!session.is_authenticated());
        assert_eq!(session.user_id().as_deref(), Some("user-1"));
    }
}
