//! Bearer-token validation seam.
//!
//! Credential issuance and validation live outside this core; the session
//! acceptor only needs "token in, principal out". The token directory
//! below backs development and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::RwLock;

#[derive(Debug)]
pub enum AuthError {
    InvalidToken,
    Unavailable,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid or expired token"),
            Self::Unavailable => write!(f, "credential validator unavailable"),
        }
    }
}

impl Error for AuthError {}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves a bearer token to a principal id. Called on every
    /// handshake; revoked tokens fail naturally on reconnect.
    async fn authenticate(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Default)]
pub struct TokenDirectory {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        TokenDirectory {
            tokens: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn insert(&self, token: impl Into<String>, principal: impl Into<String>) {
        self.tokens
            .write()
            .expect("token directory lock")
            .insert(token.into(), principal.into());
    }

    pub fn revoke(&self, token: &str) {
        self.tokens
            .write()
            .expect("token directory lock")
            .remove(token);
    }
}

#[async_trait]
impl Authenticator for TokenDirectory {
    async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .read()
            .expect("token directory lock")
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}
