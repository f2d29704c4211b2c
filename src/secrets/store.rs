use std::collections::HashMap;

use dashmap::DashMap;

use crate::error::{ControlPlaneError, Result};

/// `(context, toolName)` key as described in spec.md §6.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretContext {
    pub context: String,
    pub tool_name: String,
}

impl SecretContext {
    pub fn new(context: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self { context: context.into(), tool_name: tool_name.into() }
    }

    /// `{scope}-{server.name}` context form (spec.md §6).
    pub fn scoped(scope: &str, server_name: &str) -> Self {
        Self::new(format!("{scope}-{server_name}"), server_name)
    }
}

/// A bundle of key/value credential material, e.g. the `TOKEN_EXCHANGE_*`
/// and `AUDIT_LOG_TOKEN` entries written by §4.E.6.
pub type CredentialBundle = HashMap<String, String>;

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &SecretContext) -> Result<CredentialBundle>;
    async fn put(&self, key: &SecretContext, bundle: CredentialBundle) -> Result<()>;
    async fn delete(&self, key: &SecretContext) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySecretStore {
    records: DashMap<SecretContext, CredentialBundle>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, key: &SecretContext) -> Result<CredentialBundle> {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlPlaneError::not_found(format!("secret {}/{}", key.context, key.tool_name)))
    }

    async fn put(&self, key: &SecretContext, bundle: CredentialBundle) -> Result<()> {
        self.records.insert(key.clone(), bundle);
        Ok(())
    }

    async fn delete(&self, key: &SecretContext) -> Result<()> {
        // NotFound on cascade-delete is always swallowed (spec.md §7).
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemorySecretStore::new();
        let key = SecretContext::new("server1", "server1");
        let mut bundle = CredentialBundle::new();
        bundle.insert("TOKEN_EXCHANGE_CLIENT_ID".into(), "ns:abc".into());
        store.put(&key, bundle.clone()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), bundle);
    }

    #[tokio::test]
    async fn delete_missing_is_non_fatal() {
        let store = InMemorySecretStore::new();
        store.delete(&SecretContext::new("x", "y")).await.unwrap();
    }
}
