use std::sync::Arc;

use async_trait::async_trait;
use cloudstore_core::{AuthChallenge, Credential, CredentialProvider};
use tracing::warn;

/// Looks up the password stored for a username.
#[async_trait]
pub trait PasswordSource: Send + Sync {
    async fn password(&self, username: &str, challenge: &AuthChallenge) -> Option<String>;
}

/// Answers challenges for one account with its username and a password
/// from the shared [`PasswordSource`].
#[derive(Clone)]
pub struct AccountCredentials {
    username: String,
    passwords: Arc<dyn PasswordSource>,
}

impl AccountCredentials {
    pub fn new(username: impl Into<String>, passwords: Arc<dyn PasswordSource>) -> Self {
        Self {
            username: username.into(),
            passwords,
        }
    }
}

#[async_trait]
impl CredentialProvider for AccountCredentials {
    async fn credential(&self, challenge: &AuthChallenge) -> Option<Credential> {
        let Some(password) = self.passwords.password(&self.username, challenge).await else {
            warn!(username = %self.username, url = %challenge.url, "no password available");
            return None;
        };
        Some(Credential {
            username: self.username.clone(),
            password,
        })
    }
}
