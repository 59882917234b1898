use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use url::Url;

use crate::client::DavError;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the server asked for when it answered `401`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub url: Url,
    pub realm: Option<String>,
}

/// Supplies credentials in answer to an authentication challenge.
/// Returning `None` rejects the challenge.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, challenge: &AuthChallenge) -> Option<Credential>;
}

/// Sends requests with the session credential and answers `401` challenges
/// through a [`CredentialProvider`], retrying once with the new credential.
#[derive(Clone, Default)]
pub struct Authenticator {
    provider: Option<Arc<dyn CredentialProvider>>,
    session: Arc<Mutex<Option<Credential>>>,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider: Some(provider),
            session: Arc::default(),
        }
    }

    pub async fn send<F>(&self, url: &Url, build: F) -> Result<Response, DavError>
    where
        F: Fn() -> RequestBuilder,
    {
        let cached = self.session.lock().await.clone();
        let response = with_credential(build(), cached.as_ref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(provider) = &self.provider else {
            return Ok(response);
        };

        let challenge = AuthChallenge {
            url: url.clone(),
            realm: response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_realm),
        };
        tracing::debug!(url = %url, realm = ?challenge.realm, "authentication challenge");
        let credential = provider
            .credential(&challenge)
            .await
            .ok_or(DavError::AuthenticationRejected)?;

        let retry = with_credential(build(), Some(&credential)).send().await?;
        let mut session = self.session.lock().await;
        if retry.status() == StatusCode::UNAUTHORIZED {
            *session = None;
        } else {
            *session = Some(credential);
        }
        Ok(retry)
    }
}

fn with_credential(request: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
    match credential {
        Some(credential) => request.basic_auth(&credential.username, Some(&credential.password)),
        None => request,
    }
}

fn parse_realm(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("realm=")?;
    let rest = rest.trim_start();
    if let Some(quoted) = rest.strip_prefix('"') {
        return quoted.split('"').next().map(str::to_string);
    }
    rest.split(',').next().map(|realm| realm.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_realms() {
        assert_eq!(
            parse_realm("Basic realm=\"Files, please\""),
            Some("Files, please".to_string())
        );
        assert_eq!(
            parse_realm("Basic realm=dav, charset=\"UTF-8\""),
            Some("dav".to_string())
        );
        assert_eq!(parse_realm("Bearer"), None);
    }

    #[test]
    fn debug_output_hides_password() {
        let credential = Credential {
            username: "alice".into(),
            password: "secret".into(),
        };
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("secret"));
    }
}
