use std::sync::Arc;

use async_trait::async_trait;
use cloudstore_core::AuthChallenge;
use keyring::Entry;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sync::PasswordSource;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
}

/// Asks a human operator for a password the keyring does not hold yet.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    async fn ask(&self, username: &str, challenge: &AuthChallenge) -> Option<String>;
}

/// Account passwords in the OS keyring, one entry per username.
pub struct KeyringPasswords {
    service: String,
    prompt: Option<Arc<dyn PasswordPrompt>>,
}

impl KeyringPasswords {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    fn entry(&self, username: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, username)?)
    }

    pub fn get_password(&self, username: &str) -> Result<Option<String>, StorageError> {
        match self.entry(username)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), StorageError> {
        self.entry(username)?.set_password(password)?;
        Ok(())
    }

    pub fn delete_password(&self, username: &str) -> Result<(), StorageError> {
        match self.entry(username)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }
}

#[async_trait]
impl PasswordSource for KeyringPasswords {
    async fn password(&self, username: &str, challenge: &AuthChallenge) -> Option<String> {
        match self.get_password(username) {
            Ok(Some(password)) => return Some(password),
            Ok(None) => debug!(username, "no stored password"),
            Err(err) => warn!(username, error = %err, "keyring lookup failed"),
        }

        let password = self.prompt.as_ref()?.ask(username, challenge).await?;
        if let Err(err) = self.set_password(username, &password) {
            warn!(username, error = %err, "failed to save password");
        }
        Some(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct Operator {
        asked: AtomicUsize,
    }

    #[async_trait]
    impl PasswordPrompt for Operator {
        async fn ask(&self, username: &str, challenge: &AuthChallenge) -> Option<String> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            assert_eq!(challenge.realm.as_deref(), Some("dav"));
            Some(format!("{username}-typed"))
        }
    }

    fn challenge() -> AuthChallenge {
        AuthChallenge {
            url: Url::parse("https://x/dav/").unwrap(),
            realm: Some("dav".into()),
        }
    }

    #[tokio::test]
    async fn missing_password_falls_back_to_prompt() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let operator = Arc::new(Operator {
            asked: AtomicUsize::new(0),
        });
        let passwords = KeyringPasswords::new("org.cloudstore.test").with_prompt(operator.clone());

        let password = passwords.password("alice", &challenge()).await;
        assert_eq!(password.as_deref(), Some("alice-typed"));
        assert_eq!(operator.asked.load(Ordering::SeqCst), 1);
        passwords.delete_password("alice").unwrap();
    }

    #[tokio::test]
    async fn without_prompt_missing_password_rejects() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let passwords = KeyringPasswords::new("org.cloudstore.test");
        assert_eq!(passwords.password("bob", &challenge()).await, None);
    }
}
