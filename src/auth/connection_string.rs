//! Shared-access connection strings and namespace host normalization.

use super::SharedKey;

/// Parsed `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...` string.
///
/// Keys are matched case-insensitively; unknown keys are ignored.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Option<String>,
    pub key_name: Option<String>,
    pub key: Option<String>,
    pub entity_path: Option<String>,
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Self {
        let mut parsed = Self::default();
        for part in raw.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = Some(value.trim().to_string());
            if key.eq_ignore_ascii_case("Endpoint") {
                parsed.endpoint = value;
            } else if key.eq_ignore_ascii_case("SharedAccessKeyName") {
                parsed.key_name = value;
            } else if key.eq_ignore_ascii_case("SharedAccessKey") {
                parsed.key = value;
            } else if key.eq_ignore_ascii_case("EntityPath") {
                parsed.entity_path = value;
            }
        }
        parsed
    }

    /// Bare host of the endpoint, if one was given.
    pub fn host(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
    }

    /// Key name and key, when both are present and non-empty.
    pub fn shared_key(&self) -> Option<SharedKey> {
        match (self.key_name.as_deref(), self.key.as_deref()) {
            (Some(name), Some(key)) if !name.is_empty() && !key.is_empty() => {
                Some(SharedKey::new(name, key))
            }
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.host().is_some() && self.shared_key().is_some()
    }
}

/// Reduce a namespace or endpoint to a bare host name.
///
/// Strips `https://`, `http://` and `sb://`, then any path, trailing slash and port.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    for scheme in ["https://", "http://", "sb://", "amqps://", "amqp://"] {
        if let Some(stripped) = host.strip_prefix(scheme) {
            host = stripped;
        }
    }
    let host = host.split('/').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_case_insensitively() {
        let cs = ConnectionString::parse(
            "endpoint=sb://contoso.servicebus.windows.net/;sharedaccesskeyname=Listen;SHAREDACCESSKEY=abc=",
        );
        assert_eq!(cs.host().as_deref(), Some("contoso.servicebus.windows.net"));
        assert_eq!(cs.key_name.as_deref(), Some("Listen"));
        assert_eq!(cs.key.as_deref(), Some("abc="));
        assert!(cs.is_complete());
    }

    #[test]
    fn incomplete_string_has_no_shared_key() {
        let cs = ConnectionString::parse("Endpoint=sb://contoso.servicebus.windows.net/;junk");
        assert!(cs.shared_key().is_none());
        assert!(!cs.is_complete());
    }

    #[test]
    fn entity_path_is_captured() {
        let cs = ConnectionString::parse("Endpoint=sb://x/;EntityPath=orders");
        assert_eq!(cs.entity_path.as_deref(), Some("orders"));
    }

    #[test]
    fn normalize_host_strips_scheme_path_and_port() {
        assert_eq!(
            normalize_host("https://contoso.servicebus.windows.net:443/foo/"),
            "contoso.servicebus.windows.net"
        );
        assert_eq!(
            normalize_host(" sb://contoso.servicebus.windows.net/ "),
            "contoso.servicebus.windows.net"
        );
        assert_eq!(normalize_host("contoso.servicebus.windows.net"), "contoso.servicebus.windows.net");
    }

    #[test]
    fn debug_redacts_key() {
        let cs = ConnectionString::parse("SharedAccessKeyName=n;SharedAccessKey=topsecret");
        assert!(!format!("{cs:?}").contains("topsecret"));
    }
}
