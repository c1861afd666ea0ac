//! Authorization
//!
//! The boundary to the external identity collaborator. The bridge never
//! validates passwords or parses credentials; it asks an `Authorizer` whether
//! an opaque handshake credential maps to a principal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::AuthConfig;

/// Authenticated identity owning a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for authorization decisions
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Map a handshake credential to the principal it authorizes
    async fn authorize(&self, credential: Option<&str>) -> Option<Principal>;

    /// Get auth type name for logging
    fn auth_type(&self) -> &'static str;
}

/// Fixed table of credentials, each authorizing one principal
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self { tokens }
    }

    /// Add a credential
    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Principal::new(principal));
        self
    }

}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, credential: Option<&str>) -> Option<Principal> {
        let credential = credential.filter(|c| !c.is_empty())?;
        self.tokens.get(credential).cloned()
    }

    fn auth_type(&self) -> &'static str {
        "StaticToken"
    }
}

/// Refuses every connection
#[derive(Debug, Clone, Default)]
pub struct DenyAllAuthorizer;

#[async_trait]
impl Authorizer for DenyAllAuthorizer {
    async fn authorize(&self, _credential: Option<&str>) -> Option<Principal> {
        None
    }

    fn auth_type(&self) -> &'static str {
        "DenyAll"
    }
}

/// Create an authorizer from configuration
pub fn create_authorizer_from_config(config: &AuthConfig) -> Arc<dyn Authorizer> {
    if config.tokens.is_empty() {
        log::warn!("No credentials configured, every connection will be refused");
        return Arc::new(DenyAllAuthorizer);
    }
    let tokens = config
        .tokens
        .iter()
        .map(|(token, principal)| (token.clone(), Principal::new(principal.clone())))
        .collect();
    Arc::new(StaticTokenAuthorizer::new(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_auth() {
        let auth = StaticTokenAuthorizer::default().with_token("secret", "alice");

        assert_eq!(auth.authorize(Some("secret")).await, Some(Principal::new("alice")));
        assert_eq!(auth.authorize(Some("wrong")).await, None);
        assert_eq!(auth.authorize(Some("")).await, None);
        assert_eq!(auth.authorize(None).await, None);
        assert_eq!(auth.auth_type(), "StaticToken");
    }

    #[tokio::test]
    async fn test_deny_all() {
        assert_eq!(DenyAllAuthorizer.authorize(Some("anything")).await, None);
    }

    #[tokio::test]
    async fn test_create_from_config() {
        let config = AuthConfig::default();
        assert_eq!(create_authorizer_from_config(&config).auth_type(), "DenyAll");

        let mut config = AuthConfig::default();
        config.tokens.insert("tok".to_string(), "bob".to_string());
        let auth = create_authorizer_from_config(&config);
        assert_eq!(auth.auth_type(), "StaticToken");
        assert_eq!(auth.authorize(Some("tok")).await, Some(Principal::new("bob")));
    }
}
