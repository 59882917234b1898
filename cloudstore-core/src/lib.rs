mod auth;
mod client;
mod multistatus;
mod path;
mod resource_id;

pub use auth::{AuthChallenge, Authenticator, Credential, CredentialProvider};
pub use client::{ApiErrorClass, DavError, Listing, WebDavClient};
pub use multistatus::{DavEntry, parse_multistatus};
pub use path::{Path, PathError};
pub use resource_id::{AccountId, ResourceId, ResourceIdError, path_relative_to, url_for};
