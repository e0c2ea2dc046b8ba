//! Ports the coordinator depends on.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PullResponse, PushResponse};

/// Remote store operations used by a sync cycle.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push_table(
        &self,
        token: &str,
        table: &str,
        records: &[serde_json::Value],
    ) -> Result<PushResponse>;

    async fn pull_since(&self, token: &str, since: &str) -> Result<PullResponse>;
}

/// Source of the bearer token. `None` means the user is signed out.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>>;
}

/// Fixed token, e.g. from the environment.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential {
    token: Option<String>,
}

impl StaticCredential {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|value| !value.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}
