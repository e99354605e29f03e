use async_trait::async_trait;
use chrono::Utc;
use loom_settings::{OAuthCredentials, ProviderConfig, ProviderKind};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

/// Seconds before expiry at which a token is treated as stale.
pub const TOKEN_EXPIRY_BUFFER_SECONDS: i64 = 300;

/// OAuth token endpoint for a provider family.
#[derive(Clone, Debug)]
pub struct OAuthEndpoint {
    pub token_url: String,
    pub client_id: String,
}

impl OAuthEndpoint {
    pub fn anthropic() -> Self {
        Self {
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
        }
    }
}

/// OAuth tokens held in memory.
#[derive(Clone, Debug)]
pub struct OAuthTokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
}

impl OAuthTokens {
    pub fn from_credentials(creds: &OAuthCredentials) -> Self {
        Self {
            access_token: SecretString::from(creds.access_token.clone()),
            refresh_token: SecretString::from(creds.refresh_token.clone()),
            expires_at: creds.expires_at,
        }
    }

    pub fn to_credentials(&self) -> OAuthCredentials {
        OAuthCredentials {
            access_token: self.access_token.expose_secret().to_string(),
            refresh_token: self.refresh_token.expose_secret().to_string(),
            expires_at: self.expires_at,
        }
    }
}

/// Check if an OAuth token needs refresh (expired or within buffer).
pub fn needs_refresh(tokens: &OAuthTokens) -> bool {
    let now_ms = Utc::now().timestamp_millis();
    tokens.expires_at - now_ms < TOKEN_EXPIRY_BUFFER_SECONDS * 1000
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("provider {0} does not support OAuth refresh")]
    Unsupported(String),
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &ProviderConfig,
        tokens: &OAuthTokens,
    ) -> Result<OAuthTokens, AuthError>;
}

/// Refreshes tokens by POSTing a `refresh_token` grant to the provider.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    anthropic: OAuthEndpoint,
}

impl Default for HttpTokenRefresher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            anthropic: OAuthEndpoint::anthropic(),
        }
    }

    pub fn with_anthropic_endpoint(mut self, endpoint: OAuthEndpoint) -> Self {
        self.anthropic = endpoint;
        self
    }

    fn endpoint_for(&self, provider: &ProviderConfig) -> Result<&OAuthEndpoint, AuthError> {
        match provider.kind {
            ProviderKind::Anthropic => Ok(&self.anthropic),
            other => Err(AuthError::Unsupported(other.as_str().to_string())),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        provider: &ProviderConfig,
        tokens: &OAuthTokens,
    ) -> Result<OAuthTokens, AuthError> {
        let endpoint = self.endpoint_for(provider)?;
        if tokens.refresh_token.expose_secret().is_empty() {
            return Err(AuthError::MissingRefreshToken);
        }
        debug!(provider = %provider.id, "refreshing oauth token");

        let resp = self
            .client
            .post(&endpoint.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.expose_secret()),
                ("client_id", endpoint.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed(body));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Parse(e.to_string()))?;

        info!(provider = %provider.id, expires_in = body.expires_in, "oauth token refreshed");
        Ok(OAuthTokens {
            access_token: SecretString::from(body.access_token),
            refresh_token: SecretString::from(
                body.refresh_token
                    .unwrap_or_else(|| tokens.refresh_token.expose_secret().to_string()),
            ),
            expires_at: Utc::now().timestamp_millis() + (body.expires_in as i64 * 1000),
        })
    }
}
