//! Credential boundary. Tokens are issued and refreshed elsewhere; the
//! connection manager only ever asks for the current one, fresh on every
//! handshake attempt, so revocation takes effect on the next reconnect.

use std::sync::RwLock;

pub trait CredentialProvider: Send + Sync {
    fn current_token(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.current_token().is_some()
    }
}

/// Holds one token behind a lock. Enough for tests and tools; real apps
/// wrap their auth/refresh stack behind the same trait.
#[derive(Default)]
pub struct StaticCredentialProvider {
    token: RwLock<Option<String>>,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticCredentialProvider {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().expect("credential lock") = token;
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn current_token(&self) -> Option<String> {
        self.token.read().expect("credential lock").clone()
    }
}
