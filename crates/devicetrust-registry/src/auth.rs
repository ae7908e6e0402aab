//! Bearer tokens for the management API
//!
//! Either a fixed token supplied by the operator, or Azure AD client
//! credentials exchanged for a token that is cached until shortly before it
//! expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use devicetrust_common::config::BrokerCredentials;

use crate::error::{RegistryError, Result};

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Source of bearer tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid access token
    async fn bearer_token(&self) -> Result<String>;
}

/// A fixed token, typically from `az account get-access-token`
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// OAuth2 client credentials grant against Azure AD
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Create a provider for `{authority}/{tenant}/oauth2/v2.0/token`
    pub fn new(
        http: reqwest::Client,
        authority: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
            cache: RwLock::new(None),
        }
    }

    fn cached(&self) -> Option<String> {
        let cache = self.cache.read();
        cache
            .as_ref()
            .filter(|t| Instant::now() < t.refresh_at)
            .map(|t| t.access_token.clone())
    }

    async fn fetch(&self) -> Result<CachedToken> {
        debug!(token_url = %self.token_url, "Requesting access token");

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RegistryError::Auth {
                message: format!("token request failed: {}", e),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status.as_u16() == 429;
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}", status),
            };
            return Err(RegistryError::Auth { message, retryable });
        }

        let token: TokenResponse = response.json().await.map_err(|e| RegistryError::Auth {
            message: format!("invalid token response: {}", e),
            retryable: false,
        })?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        info!(expires_in = token.expires_in, "Access token acquired");

        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    async fn bearer_token(&self) -> Result<String> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let fresh = self.fetch().await?;
        let token = fresh.access_token.clone();
        *self.cache.write() = Some(fresh);
        Ok(token)
    }
}

/// Build the token provider the credentials describe
///
/// A static access token wins over client credentials when both are set.
pub fn token_provider_from_credentials(
    credentials: &BrokerCredentials,
    http: reqwest::Client,
) -> Result<Arc<dyn TokenProvider>> {
    if let Some(source) = &credentials.access_token {
        return Ok(Arc::new(StaticToken::new(source.resolve()?)));
    }

    match (
        &credentials.tenant_id,
        &credentials.client_id,
        &credentials.client_secret,
    ) {
        (Some(tenant_id), Some(client_id), Some(secret)) => Ok(Arc::new(ClientCredentials::new(
            http,
            &credentials.authority,
            tenant_id,
            client_id.clone(),
            secret.resolve()?,
            credentials.scope.clone(),
        ))),
        _ => Err(devicetrust_common::Error::config(
            "broker credentials require accessToken, or tenantId + clientId + clientSecret",
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicetrust_common::config::SecretSource;

    #[tokio::test]
    async fn static_token_is_returned_verbatim() {
        let provider = StaticToken::new("abc.def.ghi");
        assert_eq!(provider.bearer_token().await.unwrap(), "abc.def.ghi");
        assert!(!format!("{:?}", provider).contains("abc"));
    }

    #[test]
    fn token_url_is_built_from_authority_and_tenant() {
        let provider = ClientCredentials::new(
            reqwest::Client::new(),
            "https://login.microsoftonline.com/",
            "contoso",
            "app",
            "hunter2",
            "https://management.azure.com/.default",
        );
        assert_eq!(
            provider.token_url,
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        assert!(!format!("{:?}", provider).contains("hunter2"));
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_refresh() {
        let provider = ClientCredentials::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "tenant",
            "app",
            "hunter2",
            "scope",
        );
        *provider.cache.write() = Some(CachedToken {
            access_token: "cached".into(),
            refresh_at: Instant::now() + Duration::from_secs(60),
        });
        assert_eq!(provider.bearer_token().await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_retryable() {
        let provider = ClientCredentials::new(
            reqwest::Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
            "http://127.0.0.1:9",
            "tenant",
            "app",
            "hunter2",
            "scope",
        );
        let err = provider.bearer_token().await.unwrap_err();
        assert!(matches!(err, RegistryError::Auth { retryable: true, .. }));
    }

    #[test]
    fn static_token_wins_over_client_credentials() {
        let credentials = BrokerCredentials {
            access_token: Some(SecretSource::Pem("token".into())),
            tenant_id: Some("t".into()),
            client_id: Some("c".into()),
            client_secret: Some(SecretSource::Pem("s".into())),
            ..Default::default()
        };
        assert!(token_provider_from_credentials(&credentials, reqwest::Client::new()).is_ok());
    }

    #[test]
    fn incomplete_credentials_are_a_config_error() {
        let credentials = BrokerCredentials {
            tenant_id: Some("t".into()),
            ..Default::default()
        };
        match token_provider_from_credentials(&credentials, reqwest::Client::new()) {
            Err(err) => assert!(matches!(err, RegistryError::Config(_))),
            Ok(_) => panic!("incomplete client credentials were accepted"),
        }
    }
}
