//! Who is performing a disposition, recorded as `RejectedBy`.

use super::{Credential, SERVICE_BUS_SCOPE};
use base64::Engine;
use serde_json::Value;

/// Claims checked in order for a human-readable principal.
const NAME_CLAIMS: [&str; 6] = ["upn", "unique_name", "preferred_username", "email", "name", "appid"];

/// Extract a principal name from a JWT without verifying it.
pub fn principal_from_jwt(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    NAME_CLAIMS.iter().find_map(|claim| {
        claims
            .get(*claim)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    })
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Resolve the acting identity for `credential`.
///
/// Never fails: token errors degrade to the local user name.
pub async fn resolve_actor(credential: &Credential) -> String {
    match credential {
        Credential::SharedKey(key) => format!("sas:{}", key.key_name),
        Credential::Federated { provider, .. } => {
            match provider.get_token(&[SERVICE_BUS_SCOPE]).await {
                Ok(token) => principal_from_jwt(&token.token).unwrap_or_else(local_user),
                Err(err) => {
                    tracing::debug!("could not resolve actor from token: {err}");
                    local_user()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SharedKey, StaticTokenProvider};
    use std::sync::Arc;

    fn jwt(claims: &serde_json::Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            engine.encode(br#"{"alg":"none"}"#),
            engine.encode(claims.to_string())
        )
    }

    #[test]
    fn prefers_upn_over_name() {
        let token = jwt(&serde_json::json!({"name": "Ada", "upn": "ada@contoso.com"}));
        assert_eq!(principal_from_jwt(&token).as_deref(), Some("ada@contoso.com"));
    }

    #[test]
    fn falls_back_to_appid_for_service_principals() {
        let token = jwt(&serde_json::json!({"appid": "1111-2222"}));
        assert_eq!(principal_from_jwt(&token).as_deref(), Some("1111-2222"));
    }

    #[test]
    fn garbage_token_has_no_principal() {
        assert!(principal_from_jwt("not-a-jwt").is_none());
        assert!(principal_from_jwt("a.!!!.c").is_none());
    }

    #[tokio::test]
    async fn shared_key_actor_uses_key_name() {
        let credential = Credential::SharedKey(SharedKey::new("Manage", "k"));
        assert_eq!(resolve_actor(&credential).await, "sas:Manage");
    }

    #[tokio::test]
    async fn federated_actor_reads_token_claims() {
        let token = jwt(&serde_json::json!({"unique_name": "ops@contoso.com"}));
        let credential = Credential::federated(Arc::new(StaticTokenProvider::new(token)));
        assert_eq!(resolve_actor(&credential).await, "ops@contoso.com");
    }
}
