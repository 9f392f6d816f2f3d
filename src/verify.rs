//! Shared-access-key connectivity check.

use crate::auth::ConnectionString;
use crate::transport::{connect_with_retry, Connector, Endpoint};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shortest deadline a check is given.
pub const MIN_VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasVerification {
    pub ok: bool,
    pub message: String,
    pub host: Option<String>,
    pub policy: Option<String>,
}

/// Open (and close) a SASL `PLAIN` connection with the key in `connection_string`.
pub async fn verify_sas(
    connector: &dyn Connector,
    connection_string: &str,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> SasVerification {
    let parsed = ConnectionString::parse(connection_string);
    let (Some(host), Some(key)) = (parsed.host(), parsed.shared_key()) else {
        return SasVerification {
            ok: false,
            message: "Invalid connection string (missing Endpoint/KeyName/Key).".into(),
            host: parsed.host(),
            policy: parsed.key_name.clone(),
        };
    };

    let endpoint = Endpoint::new(host.clone()).with_port(port);
    let deadline = timeout.max(MIN_VERIFY_TIMEOUT);
    match connect_with_retry(connector, &endpoint, &key.sasl(), deadline, cancel).await {
        Ok(session) => {
            if let Err(err) = session.close().await {
                tracing::debug!("closing verification session failed: {err}");
            }
            SasVerification {
                ok: true,
                message: format!("AMQP SAS connected to {host} as {}.", key.key_name),
                host: Some(host),
                policy: Some(key.key_name),
            }
        }
        Err(err) => {
            tracing::warn!(host = %host, "SAS verification failed: {err}");
            SasVerification {
                ok: false,
                message: format!("AMQP SAS connection to {host} failed: {err}"),
                host: Some(host),
                policy: Some(key.key_name),
            }
        }
    }
}
