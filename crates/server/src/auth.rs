use async_trait::async_trait;
use shared::domain::UserId;
use storage::Storage;

/// The auth collaborator. The chat subsystem trusts the resolved identity
/// opaquely; swapping in an SSO-backed implementation is a deployment
/// concern, not a chat concern.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn identify(&self, bearer: &str) -> anyhow::Result<Option<UserId>>;
}

/// Default authenticator backed by the tokens issued at login.
pub struct TokenAuthenticator {
    storage: Storage,
}

impl TokenAuthenticator {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn identify(&self, bearer: &str) -> anyhow::Result<Option<UserId>> {
        self.storage.resolve_auth_token(bearer).await
    }
}
