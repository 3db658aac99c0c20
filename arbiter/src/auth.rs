//! Token verification seam. The server neither stores nor decodes tokens
//! itself; it only consults a verifier behind this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;

/// Identity attached to an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Error)]
#[error("invalid token")]
pub struct InvalidToken;

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser, InvalidToken>;
}

/// Verifier backed by the static token table in the configuration. Suits
/// self-hosted deployments; an external identity service plugs in behind the
/// same trait.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthUser>,
}

impl StaticTokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|(token, user)| {
                (
                    token.clone(),
                    AuthUser {
                        id: user.id.clone(),
                        email: user.email.clone(),
                    },
                )
            })
            .collect();

        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, InvalidToken> {
        match self.tokens.get(token) {
            Some(user) => Ok(user.clone()),
            None => {
                debug!("Token not in static table");
                Err(InvalidToken)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StaticUser;

    use super::*;

    fn verifier() -> StaticTokenVerifier {
        let mut config = AuthConfig::default();
        config.tokens.insert(
            "valid".into(),
            StaticUser {
                id: "u1".into(),
                email: "a@b".into(),
            },
        );
        StaticTokenVerifier::new(&config)
    }

    #[tokio::test]
    async fn known_token_resolves() {
        let user = verifier().verify("valid").await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "a@b");
    }

    #[tokio::test]
    async fn unknown_token_fails() {
        assert!(verifier().verify("forged").await.is_err());
    }
}
