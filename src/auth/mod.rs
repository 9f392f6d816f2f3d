//! Credentials, token providers and the CBS handshake.

pub mod cbs;
pub mod connection_string;
pub mod identity;
pub mod providers;

pub use connection_string::{normalize_host, ConnectionString};
pub use providers::{AzureCliTokenProvider, ClientSecretTokenProvider, StaticTokenProvider};

use crate::transport::{SaslMode, TransportError};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Scope requested from identity providers for broker access.
pub const SERVICE_BUS_SCOPE: &str = "https://servicebus.azure.net/.default";

/// Token type used when a shared key signs its own SAS token.
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Printed next to any authorization failure.
pub const UNAUTHORIZED_HINT: &str =
    "Unauthorized: require Azure Service Bus Data Receiver (Listen) on entity.";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("put-token for {audience} was not acknowledged (tried: {tried})")]
    NotAcknowledged { audience: String, tried: String },
    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),
    #[error("invalid connection string (missing Endpoint/KeyName/Key)")]
    InvalidConnectionString,
    #[error("SAS signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Transport(err) => err.is_unauthorized(),
            _ => false,
        }
    }
}

/// An access token plus its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens for federated identities.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Short label for logs ("azure-cli", "client-secret", ...).
    fn name(&self) -> &str;

    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, AuthError>;
}

// ── Shared keys ──────────────────────────────────────────────────

/// A shared access policy name and key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    pub key_name: String,
    pub key: String,
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SharedKey {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    /// SASL `PLAIN` with username = key name, password = key.
    pub fn sasl(&self) -> SaslMode {
        SaslMode::Plain {
            username: self.key_name.clone(),
            password: self.key.clone(),
        }
    }

    /// Sign a `SharedAccessSignature` token for `audience`, valid for `ttl`.
    pub fn sas_token(&self, audience: &str, ttl: Duration) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expiry = Utc::now().timestamp().saturating_add(ttl);
        self.sas_token_with_expiry(audience, expiry)
    }

    fn sas_token_with_expiry(&self, audience: &str, expiry: i64) -> Result<String, AuthError> {
        let encoded_audience = urlencoding::encode(audience);
        let to_sign = format!("{encoded_audience}\n{expiry}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(to_sign.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!(
            "SharedAccessSignature sr={encoded_audience}&sig={}&se={expiry}&skn={}",
            urlencoding::encode(&signature),
            urlencoding::encode(&self.key_name)
        ))
    }
}

// ── Credential ───────────────────────────────────────────────────

/// How the tool proves its identity to the broker.
#[derive(Clone)]
pub enum Credential {
    /// Shared access key, presented over SASL `PLAIN`.
    SharedKey(SharedKey),
    /// Token-issuing identity, presented over CBS after SASL `ANONYMOUS`.
    /// `fallback` is tried when the token is refused.
    Federated {
        provider: Arc<dyn TokenProvider>,
        fallback: Option<SharedKey>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedKey(key) => f.debug_tuple("SharedKey").field(key).finish(),
            Self::Federated { provider, fallback } => f
                .debug_struct("Federated")
                .field("provider", &provider.name())
                .field("fallback", fallback)
                .finish(),
        }
    }
}

impl Credential {
    pub fn federated(provider: Arc<dyn TokenProvider>) -> Self {
        Self::Federated {
            provider,
            fallback: None,
        }
    }

    pub fn with_fallback(self, key: Option<SharedKey>) -> Self {
        match self {
            Self::Federated { provider, .. } => Self::Federated {
                provider,
                fallback: key,
            },
            other => other,
        }
    }

    /// Shared key usable without CBS, if any.
    pub fn shared_key(&self) -> Option<&SharedKey> {
        match self {
            Self::SharedKey(key) => Some(key),
            Self::Federated { fallback, .. } => fallback.as_ref(),
        }
    }
}

/// `<scheme>://<host>/<path>`.
pub fn audience(scheme: &str, host: &str, path: &str) -> String {
    format!("{scheme}://{host}/{}", path.trim_start_matches('/'))
}

// ── Classification ───────────────────────────────────────────────

/// True when any error in the chain is an authorization failure.
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(auth) = cause.downcast_ref::<AuthError>() {
            if auth.is_unauthorized() {
                return true;
            }
        }
        if let Some(transport) = cause.downcast_ref::<TransportError>() {
            if transport.is_unauthorized() {
                return true;
            }
        }
        let text = cause.to_string();
        text.contains("Unauthorized")
            || text.contains("unauthorized")
            || text.contains("401")
            || text.contains("403")
    })
}
