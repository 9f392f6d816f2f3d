//! Deadline-bounded connection establishment.
//!
//! Each attempt gets at most [`ATTEMPT_TIMEOUT`] (or whatever is left of the
//! deadline), followed by a short pause. SASL rejections are returned
//! immediately; everything else is retried until the deadline and then
//! reported as a single timeout carrying the last underlying error.

use super::traits::{Connector, Endpoint, LinkSession, SaslMode, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound for a single connection attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between failed attempts.
pub const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Retry `attempt` until it succeeds, the deadline passes or `cancel` fires.
pub async fn retry_until_deadline<T, F, Fut>(
    operation: &'static str,
    deadline: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let started = Instant::now();
    let mut last_error = String::from("no attempt completed");
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(TransportError::timeout(operation, last_error));
        }

        attempts += 1;
        let budget = remaining.min(ATTEMPT_TIMEOUT);
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            outcome = tokio::time::timeout(budget, attempt()) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => {
                tracing::debug!(operation, attempts, "connected");
                return Ok(value);
            }
            Ok(Err(err)) if err.is_unauthorized() => return Err(err),
            Ok(Err(TransportError::Cancelled)) => return Err(TransportError::Cancelled),
            Ok(Err(err)) => {
                tracing::warn!(operation, attempt = attempts, "attempt failed: {err}");
                last_error = err.to_string();
            }
            Err(_) => {
                tracing::warn!(
                    operation,
                    attempt = attempts,
                    "attempt timed out after {}ms",
                    budget.as_millis()
                );
                last_error = format!("attempt timed out after {}ms", budget.as_millis());
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            continue;
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            () = tokio::time::sleep(remaining.min(RETRY_PAUSE)) => {}
        }
    }
}

/// Open a connection and session through `connector`, retrying under `deadline`.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    sasl: &SaslMode,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn LinkSession>, TransportError> {
    tracing::info!(host = %endpoint.host, port = endpoint.port, "opening AMQP connection");
    retry_until_deadline("AMQP connect", deadline, cancel, || {
        connector.open(endpoint, sasl)
    })
    .await
}

/// Run one broker call, giving up after `limit`.
///
/// Not cancellable; used for cleanup (abandon, close) that must still run
/// after cancellation.
pub async fn within<T, Fut>(
    operation: &'static str,
    limit: Duration,
    call: Fut,
) -> Result<T, TransportError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::timeout(
            operation,
            format!("no response within {}ms", limit.as_millis()),
        )),
    }
}

/// Run one broker call under `limit`, returning early when `cancel` fires.
pub async fn bounded<T, Fut>(
    operation: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    call: Fut,
) -> Result<T, TransportError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(TransportError::Cancelled),
        result = within(operation, limit, call) => result,
    }
}

/// Close a session without making the caller wait for the broker.
pub fn close_in_background(session: Box<dyn LinkSession>) {
    tokio::spawn(async move {
        if let Err(err) = session.close().await {
            tracing::debug!("background session close failed: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let value = retry_until_deadline("AMQP connect", Duration::from_secs(10), &cancel, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Disconnected("refused".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_last_error() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let err = retry_until_deadline::<(), _, _>(
            "AMQP connect",
            Duration::from_secs(3),
            &cancel,
            || async { Err(TransportError::Disconnected("host unreachable".into())) },
        )
        .await
        .unwrap_err();

        assert!(started.elapsed() <= Duration::from_secs(4));
        assert_eq!(
            err.to_string(),
            "AMQP connect failed within deadline: connection lost: host unreachable"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_are_bounded() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let err = retry_until_deadline::<(), _, _>(
            "AMQP connect",
            Duration::from_secs(5),
            &cancel,
            || std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert!(err.to_string().contains("timed out after 2000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let err = retry_until_deadline::<(), _, _>(
            "AMQP connect",
            Duration::from_secs(10),
            &cancel,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Unauthorized("sasl rejected".into())) }
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = retry_until_deadline::<(), _, _>(
            "AMQP connect",
            Duration::from_secs(10),
            &cancel,
            || std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let started = Instant::now();
        let err = within::<(), _>("send", Duration::from_secs(3), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { operation: "send", .. }));
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_call_yields_to_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let err = bounded::<(), _>(
            "send",
            Duration::from_secs(3600),
            &cancel,
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
