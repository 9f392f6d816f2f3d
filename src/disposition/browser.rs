//! Credit-limited, deadline-bounded browse of one address.

use super::{BeforeSettle, DispositionError};
use crate::model::MessageDescriptor;
use crate::transport::{bounded, within, BrowseLink, Delivery, LinkSession};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Longest single poll on the link.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Credit and time window for one browse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowseAttempt {
    pub credit: u32,
    pub window: Duration,
}

/// What the browser should do with the match.
#[derive(Clone, Copy)]
pub struct OnMatch<'a> {
    pub before_settle: Option<&'a dyn BeforeSettle>,
    /// Limit for each attach, accept, release and close call.
    pub settle_timeout: Duration,
}

fn matches(delivery: &Delivery, sequence: i64, session_id: Option<&str>) -> bool {
    if let Some(wanted) = session_id {
        if delivery.message.session_id.as_deref() != Some(wanted) {
            return false;
        }
    }
    delivery.message.sequence_number == sequence
}

/// Look for `sequence` (optionally within `session_id`) on `address` and
/// accept it.
///
/// Everything else received is released immediately. The link is closed on
/// every exit. Returns `Ok(None)` when the window elapses without a match.
pub async fn browse(
    session: &mut dyn LinkSession,
    address: &str,
    sequence: i64,
    session_id: Option<&str>,
    attempt: BrowseAttempt,
    on_match: OnMatch<'_>,
    cancel: &CancellationToken,
) -> Result<Option<MessageDescriptor>, DispositionError> {
    let limit = on_match.settle_timeout;
    let mut link = bounded(
        "browse link attach",
        limit,
        cancel,
        session.open_browse_link(address, attempt.credit),
    )
    .await?;
    let result = scan(
        link.as_mut(),
        sequence,
        session_id,
        attempt,
        on_match,
        cancel,
    )
    .await;
    if let Err(err) = within("browse link close", limit, link.close()).await {
        tracing::debug!(address, "closing browse link failed: {err}");
    }
    result
}

async fn scan(
    link: &mut dyn BrowseLink,
    sequence: i64,
    session_id: Option<&str>,
    attempt: BrowseAttempt,
    on_match: OnMatch<'_>,
    cancel: &CancellationToken,
) -> Result<Option<MessageDescriptor>, DispositionError> {
    let deadline = Instant::now() + attempt.window;
    let limit = on_match.settle_timeout;
    let mut seen = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(sequence, seen, "browse window elapsed");
            return Ok(None);
        }

        let received = tokio::select! {
            () = cancel.cancelled() => return Err(DispositionError::Cancelled),
            received = link.recv(remaining.min(POLL_INTERVAL)) => received?,
        };
        let Some(delivery) = received else {
            continue;
        };
        seen += 1;

        if !matches(&delivery, sequence, session_id) {
            if let Err(err) = within("release", limit, link.release(&delivery)).await {
                tracing::debug!(
                    sequence = delivery.message.sequence_number,
                    "release failed: {err}"
                );
            }
            continue;
        }

        if let Some(hook) = on_match.before_settle {
            if let Err(err) = hook.before_settle(&delivery.message).await {
                if let Err(release) = within("release", limit, link.release(&delivery)).await {
                    tracing::debug!(sequence, "release after failed hook: {release}");
                }
                return Err(err);
            }
        }

        bounded("accept", limit, cancel, link.accept(&delivery)).await?;
        tracing::info!(sequence, seen, "target accepted");
        return Ok(Some(delivery.message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(sequence: i64, session: Option<&str>) -> Delivery {
        let mut message = MessageDescriptor::new(sequence);
        message.session_id = session.map(ToString::to_string);
        Delivery { id: 0, message }
    }

    #[test]
    fn session_must_match_when_given() {
        assert!(matches(&delivery(77, Some("abc")), 77, Some("abc")));
        assert!(!matches(&delivery(77, Some("xyz")), 77, Some("abc")));
        assert!(!matches(&delivery(77, None), 77, Some("abc")));
    }

    #[test]
    fn sequence_alone_matches_without_session() {
        assert!(matches(&delivery(5, Some("any")), 5, None));
        assert!(!matches(&delivery(6, None), 5, None));
    }
}
