//! Where tunnel sessions get their username and password from.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use dialoguer::{Input, Password};
use tracing::debug;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials for a tunnel target.
///
/// `force` is set after the server rejected what was supplied last time;
/// returning `None` abandons the session. Implementations may block.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, target: &str, username: Option<&str>, force: bool) -> Option<Credentials>;
}

/// Fixed credentials, typically from configuration or the environment.
/// Once rejected there is nothing else to offer.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self, _target: &str, _username: Option<&str>, force: bool) -> Option<Credentials> {
        (!force).then(|| self.credentials.clone())
    }
}

/// Asks on the terminal and remembers the answer per target.
///
/// Only one prompt is shown at a time; sessions waiting behind it pick up
/// the cached answer.
#[derive(Debug, Default)]
pub struct PromptCredentials {
    cache: Mutex<HashMap<String, Credentials>>,
}

impl PromptCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialSource for PromptCredentials {
    fn credentials(&self, target: &str, username: Option<&str>, force: bool) -> Option<Credentials> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !force {
            if let Some(credentials) = cache.get(target) {
                return Some(credentials.clone());
            }
        }

        let username = match username {
            Some(username) => username.to_owned(),
            None => Input::<String>::new()
                .with_prompt(format!("Username for {target}"))
                .interact_text()
                .ok()?,
        };
        let password = Password::new()
            .with_prompt(format!("Password for {username} at {target}"))
            .interact()
            .ok()?;

        debug!(target = %target, user = %username, "Got credentials from prompt");
        let credentials = Credentials::new(username, password);
        cache.insert(target.to_owned(), credentials.clone());
        Some(credentials)
    }
}
