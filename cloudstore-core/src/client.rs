use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::auth::Authenticator;
use crate::multistatus::{DavEntry, parse_multistatus};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:allprop/></d:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("malformed xml: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication challenge was rejected")]
    AuthenticationRejected,
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Result of a one-level listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    MultiStatus(Vec<DavEntry>),
    NotFound,
}

/// Short-lived request client for collection listings.
#[derive(Clone)]
pub struct WebDavClient {
    http: Client,
    auth: Authenticator,
}

impl WebDavClient {
    pub fn new() -> Self {
        Self::with_authenticator(Authenticator::default())
    }

    pub fn with_authenticator(auth: Authenticator) -> Self {
        Self {
            http: Client::new(),
            auth,
        }
    }

    pub async fn list_one_level(&self, url: &Url) -> Result<Listing, DavError> {
        let propfind = Method::from_bytes(b"PROPFIND")
            .map_err(|err| DavError::InvalidRequest(err.to_string()))?;
        let response = self
            .auth
            .send(url, || {
                self.http
                    .request(propfind.clone(), url.clone())
                    .header("Depth", "1")
                    .header(CONTENT_TYPE, "application/xml; charset=utf-8")
                    .body(PROPFIND_BODY)
            })
            .await?;

        match response.status() {
            StatusCode::MULTI_STATUS => {
                let body = response.text().await?;
                Ok(Listing::MultiStatus(parse_multistatus(&body, url)?))
            }
            StatusCode::NOT_FOUND => Ok(Listing::NotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DavError::Api { status, body })
            }
        }
    }
}

impl Default for WebDavClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DavError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            DavError::AuthenticationRejected => Some(ApiErrorClass::Auth),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        let api = |status| DavError::Api {
            status,
            body: String::new(),
        };
        assert_eq!(
            api(StatusCode::UNAUTHORIZED).classification(),
            Some(ApiErrorClass::Auth)
        );
        assert_eq!(
            api(StatusCode::TOO_MANY_REQUESTS).classification(),
            Some(ApiErrorClass::RateLimit)
        );
        assert_eq!(
            api(StatusCode::BAD_GATEWAY).classification(),
            Some(ApiErrorClass::Transient)
        );
        assert_eq!(
            api(StatusCode::METHOD_NOT_ALLOWED).classification(),
            Some(ApiErrorClass::Permanent)
        );
        assert_eq!(DavError::Cancelled.classification(), None);
    }
}
