//! Browse-and-match disposition for sessionful dead-letter sub-queues.
//!
//! Sub-queues reject session filters, so the target is found by browsing an
//! unfiltered link and matching session id plus sequence number. A second,
//! wider pass runs on a fresh link when the first one finds nothing.

use super::browser::{browse, BrowseAttempt, OnMatch};
use super::{BeforeSettle, DispositionError};
use crate::auth::{self, cbs, AuthError, Credential, SharedKey, SERVICE_BUS_SCOPE};
use crate::model::{EntityRef, SubQueue};
use crate::transport::{
    close_in_background, connect_with_retry, Connector, Endpoint, LinkSession, SaslMode,
    TransportError,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection and CBS settings for the raw path.
#[derive(Debug, Clone)]
pub struct RawBrowseSettings {
    pub endpoint: Endpoint,
    pub cbs_audience_scheme: String,
    pub token_types: Vec<String>,
    pub connect_timeout: Duration,
    pub cbs_response_timeout: Duration,
    /// Limit for each link attach, settle and close call.
    pub settle_timeout: Duration,
}

/// The two escalating browse passes for a size hint.
pub fn attempt_plan(max_hint: u32) -> Vec<BrowseAttempt> {
    let first_window = u64::from(max_hint / 10).saturating_add(8).clamp(8, 20);
    let second_window = first_window + 10 + u64::from((max_hint / 20).min(10));
    vec![
        BrowseAttempt {
            credit: max_hint.saturating_mul(5).clamp(100, 1000),
            window: Duration::from_secs(first_window),
        },
        BrowseAttempt {
            credit: max_hint.saturating_mul(10).clamp(200, 2000),
            window: Duration::from_secs(second_window),
        },
    ]
}

async fn connect_plain(
    connector: &dyn Connector,
    key: &SharedKey,
    settings: &RawBrowseSettings,
    cancel: &CancellationToken,
) -> Result<Box<dyn LinkSession>, DispositionError> {
    Ok(connect_with_retry(
        connector,
        &settings.endpoint,
        &key.sasl(),
        settings.connect_timeout,
        cancel,
    )
    .await?)
}

async fn connect_federated(
    connector: &dyn Connector,
    provider: &dyn auth::TokenProvider,
    address: &str,
    settings: &RawBrowseSettings,
    cancel: &CancellationToken,
) -> Result<Box<dyn LinkSession>, AuthError> {
    let token = provider.get_token(&[SERVICE_BUS_SCOPE]).await?;
    let mut session = connect_with_retry(
        connector,
        &settings.endpoint,
        &SaslMode::Anonymous,
        settings.connect_timeout,
        cancel,
    )
    .await?;

    let audience = auth::audience(
        &settings.cbs_audience_scheme,
        &settings.endpoint.host,
        address,
    );
    match cbs::put_token(
        session.as_mut(),
        &audience,
        &token.token,
        &settings.token_types,
        settings.cbs_response_timeout,
        cancel,
    )
    .await
    {
        Ok(()) => Ok(session),
        Err(err) => {
            close_in_background(session);
            Err(err)
        }
    }
}

/// Open a session that is allowed to read `address`.
///
/// Never returns an unauthenticated session: if neither the federated token
/// nor the fallback shared key is accepted the result is `Unauthorized`.
async fn open_authorized(
    connector: &dyn Connector,
    address: &str,
    credential: &Credential,
    settings: &RawBrowseSettings,
    cancel: &CancellationToken,
) -> Result<Box<dyn LinkSession>, DispositionError> {
    let (provider, fallback) = match credential {
        Credential::SharedKey(key) => return connect_plain(connector, key, settings, cancel).await,
        Credential::Federated { provider, fallback } => (provider, fallback),
    };

    let federated_error =
        match connect_federated(connector, provider.as_ref(), address, settings, cancel).await {
            Ok(session) => return Ok(session),
            Err(AuthError::Transport(TransportError::Cancelled)) => {
                return Err(DispositionError::Cancelled)
            }
            Err(err) => err,
        };

    let Some(key) = fallback else {
        return Err(federated_error.into());
    };
    tracing::warn!(
        address,
        "federated authorization failed ({federated_error}); falling back to shared key"
    );
    match connect_plain(connector, key, settings, cancel).await {
        Ok(session) => Ok(session),
        Err(DispositionError::Cancelled) => Err(DispositionError::Cancelled),
        Err(fallback_error) => Err(DispositionError::Unauthorized(format!(
            "federated: {federated_error}; shared key: {fallback_error}"
        ))),
    }
}

/// Find `sequence` in the dead-letter sub-queue of `entity` and complete it.
///
/// Returns `Ok(false)` when both passes finish without a match.
#[allow(clippy::too_many_arguments)]
pub async fn browse_and_complete(
    connector: &dyn Connector,
    entity: &EntityRef,
    session_id: Option<&str>,
    sequence: i64,
    max_hint: u32,
    credential: &Credential,
    settings: &RawBrowseSettings,
    cancel: &CancellationToken,
) -> Result<bool, DispositionError> {
    browse_and_settle(
        connector,
        entity,
        session_id,
        sequence,
        max_hint,
        credential,
        settings,
        None,
        cancel,
    )
    .await
}

/// Like [`browse_and_complete`], running `before_settle` on the match first.
#[allow(clippy::too_many_arguments)]
pub async fn browse_and_settle(
    connector: &dyn Connector,
    entity: &EntityRef,
    session_id: Option<&str>,
    sequence: i64,
    max_hint: u32,
    credential: &Credential,
    settings: &RawBrowseSettings,
    before_settle: Option<&dyn BeforeSettle>,
    cancel: &CancellationToken,
) -> Result<bool, DispositionError> {
    let address = entity.address(SubQueue::DeadLetter);
    let plan = attempt_plan(max_hint);
    let started = Instant::now();

    let mut session = open_authorized(connector, &address, credential, settings, cancel).await?;

    let mut outcome = Ok(false);
    for (pass, attempt) in plan.iter().enumerate() {
        tracing::info!(
            entity = %entity,
            sequence,
            attempt = pass + 1,
            credit = attempt.credit,
            window_secs = attempt.window.as_secs(),
            "browsing dead-letter sub-queue"
        );
        match browse(
            session.as_mut(),
            &address,
            sequence,
            session_id,
            *attempt,
            OnMatch {
                before_settle,
                settle_timeout: settings.settle_timeout,
            },
            cancel,
        )
        .await
        {
            Ok(Some(_)) => {
                outcome = Ok(true);
                break;
            }
            Ok(None) => {}
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    close_in_background(session);

    if matches!(outcome, Ok(false)) {
        tracing::warn!(
            entity = %entity,
            sequence,
            session = ?session_id,
            plan = ?plan,
            elapsed_ms = started.elapsed().as_millis(),
            "target not found after all browse passes"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_hint_uses_floors() {
        let plan = attempt_plan(1);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].credit, 100);
        assert_eq!(plan[0].window, Duration::from_secs(8));
        assert_eq!(plan[1].credit, 200);
        assert_eq!(plan[1].window, Duration::from_secs(18));
    }

    #[test]
    fn large_hint_hits_ceilings() {
        let plan = attempt_plan(10_000);
        assert_eq!(plan[0].credit, 1000);
        assert_eq!(plan[0].window, Duration::from_secs(20));
        assert_eq!(plan[1].credit, 2000);
        assert_eq!(plan[1].window, Duration::from_secs(40));
    }

    #[test]
    fn mid_hint_scales_linearly() {
        let plan = attempt_plan(60);
        assert_eq!(plan[0].credit, 300);
        assert_eq!(plan[0].window, Duration::from_secs(14));
        assert_eq!(plan[1].credit, 600);
        assert_eq!(plan[1].window, Duration::from_secs(27));
    }

    #[test]
    fn second_pass_is_always_wider() {
        for hint in [0, 1, 19, 100, 250, 5000] {
            let plan = attempt_plan(hint);
            assert!(plan[1].credit > plan[0].credit);
            assert!(plan[1].window > plan[0].window);
        }
    }
}
