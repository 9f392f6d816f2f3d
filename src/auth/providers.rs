//! Concrete [`TokenProvider`] implementations.

use super::{AccessToken, AuthError, TokenProvider};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;

/// Tokens this close to expiry are refreshed.
const REFRESH_SKEW_SECS: i64 = 90;
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const CLI_RESOURCE: &str = "https://servicebus.azure.net";

fn fresh(cached: &Mutex<Option<AccessToken>>) -> Option<AccessToken> {
    let guard = cached.lock();
    guard
        .as_ref()
        .filter(|t| t.expires_at - ChronoDuration::seconds(REFRESH_SKEW_SECS) > Utc::now())
        .cloned()
}

// ── Static ───────────────────────────────────────────────────────

/// A pre-acquired token, e.g. from `SBCLI_ACCESS_TOKEN`.
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken {
                token: token.into(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            },
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_token(&self, _scopes: &[&str]) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }
}

// ── Azure CLI ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

fn parse_cli_expiry(value: Option<&serde_json::Value>) -> DateTime<Utc> {
    let epoch = match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    epoch
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(|| Utc::now() + ChronoDuration::minutes(30))
}

/// Shells out to `az account get-access-token`.
pub struct AzureCliTokenProvider {
    program: String,
    cached: Mutex<Option<AccessToken>>,
}

impl Default for AzureCliTokenProvider {
    fn default() -> Self {
        Self::new("az")
    }
}

impl AzureCliTokenProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for AzureCliTokenProvider {
    fn name(&self) -> &str {
        "azure-cli"
    }

    async fn get_token(&self, _scopes: &[&str]) -> Result<AccessToken, AuthError> {
        if let Some(token) = fresh(&self.cached) {
            return Ok(token);
        }

        let output = tokio::process::Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                CLI_RESOURCE,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| AuthError::TokenAcquisition(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::TokenAcquisition(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let parsed: CliTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| AuthError::TokenAcquisition(format!("unexpected az output: {e}")))?;
        let token = AccessToken {
            token: parsed.access_token,
            expires_at: parse_cli_expiry(parsed.expires_on.as_ref()),
        };
        *self.cached.lock() = Some(token.clone());
        Ok(token)
    }
}

// ── Client secret ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth2 client-credentials flow against the Microsoft identity platform.
pub struct ClientSecretTokenProvider {
    client: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<AccessToken>>,
}

impl ClientSecretTokenProvider {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Override the identity authority (used by tests).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority,
            urlencoding::encode(&self.tenant_id)
        )
    }
}

#[async_trait]
impl TokenProvider for ClientSecretTokenProvider {
    fn name(&self) -> &str {
        "client-secret"
    }

    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, AuthError> {
        if let Some(token) = fresh(&self.cached) {
            return Ok(token);
        }

        let scope = if scopes.is_empty() {
            super::SERVICE_BUS_SCOPE.to_string()
        } else {
            scopes.join(" ")
        };

        let response = self
            .client
            .post(self.token_endpoint())
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::TokenAcquisition(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read token response body>".to_string());
        let parsed = serde_json::from_str::<OauthTokenResponse>(&body).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|p| p.error_description.as_deref().or(p.error.as_deref()))
                .filter(|msg| !msg.trim().is_empty())
                .unwrap_or(body.as_str());
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(AuthError::Unauthorized(format!("HTTP {status}: {detail}")));
            }
            return Err(AuthError::TokenAcquisition(format!("HTTP {status}: {detail}")));
        }

        let payload = parsed
            .ok_or_else(|| AuthError::TokenAcquisition("token response is not JSON".into()))?;
        let access_token = payload
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AuthError::TokenAcquisition("token response has no access_token".into()))?;

        let token = AccessToken {
            token: access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(payload.expires_in.unwrap_or(3600)),
        };
        *self.cached.lock() = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_expiry_accepts_number_and_string() {
        let n = serde_json::json!(1_700_000_000);
        assert_eq!(parse_cli_expiry(Some(&n)).timestamp(), 1_700_000_000);
        let s = serde_json::json!("1700000000");
        assert_eq!(parse_cli_expiry(Some(&s)).timestamp(), 1_700_000_000);
        assert!(parse_cli_expiry(None) > Utc::now());
    }

    #[tokio::test]
    async fn static_provider_returns_token() {
        let provider = StaticTokenProvider::new("abc");
        let token = provider.get_token(&[]).await.unwrap();
        assert_eq!(token.token, "abc");
        assert!(token.expires_at > Utc::now());
    }

    #[test]
    fn token_endpoint_uses_tenant() {
        let provider = ClientSecretTokenProvider::new("tenant-1", "c", "s")
            .with_authority("http://127.0.0.1:9999/");
        assert_eq!(
            provider.token_endpoint(),
            "http://127.0.0.1:9999/tenant-1/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn missing_cli_program_reports_acquisition_error() {
        let provider = AzureCliTokenProvider::new("definitely-not-a-real-az-binary");
        let err = provider.get_token(&[]).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenAcquisition(_)));
    }
}
