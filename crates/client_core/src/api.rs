use std::{fmt, sync::Arc};

use async_trait::async_trait;
use shared::{domain::UserProfile, error::ApiError};

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub passphrase: String,
    pub totp: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        passphrase: impl Into<String>,
        totp: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            passphrase: passphrase.into(),
            totp: totp.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("passphrase", &"<redacted>")
            .field("totp", &"<redacted>")
            .finish()
    }
}

/// A handle on the remote server, bound to one set of credentials.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn authenticate(&self) -> Result<UserProfile, ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;
    /// True once `authenticate` has obtained a session token.
    fn has_token(&self) -> bool;
}

pub trait ApiConnector: Send + Sync {
    fn connect(&self, credentials: Credentials) -> Arc<dyn RemoteApi>;
}

pub struct MissingApiConnector;

impl ApiConnector for MissingApiConnector {
    fn connect(&self, _credentials: Credentials) -> Arc<dyn RemoteApi> {
        Arc::new(MissingRemoteApi)
    }
}

pub struct MissingRemoteApi;

#[async_trait]
impl RemoteApi for MissingRemoteApi {
    async fn authenticate(&self) -> Result<UserProfile, ApiError> {
        Err(ApiError::unreachable("remote api transport is unavailable"))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        Err(ApiError::unreachable("remote api transport is unavailable"))
    }

    fn has_token(&self) -> bool {
        false
    }
}

/// Values produced by calls the controller dispatches through the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallValue {
    Authenticated(UserProfile),
    LoggedOut,
}
