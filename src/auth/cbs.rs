//! Claims-based-security `put-token` handshake on the `$cbs` node.
//!
//! Candidate token types are tried in order. For each one a request is sent
//! and replies are read until one carries our `message-id` as its
//! `correlation-id`. Replies for other requests are ignored.

use super::AuthError;
use crate::transport::{CbsLink, CbsRequest, LinkSession, TransportError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receive credit granted on the reply link.
pub const CBS_REPLY_CREDIT: u32 = 5;
/// How far in the future a put-token request says the token expires.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

enum CandidateResult {
    Accepted,
    Refused(i32),
    NoReply,
}

fn is_success(status: i32) -> bool {
    status == 200 || status == 202
}

fn is_denied(status: i32) -> bool {
    status == 401 || status == 403
}

/// Authorize `audience` on `session` with `token`.
pub async fn put_token(
    session: &mut dyn LinkSession,
    audience: &str,
    token: &str,
    token_types: &[String],
    response_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), AuthError> {
    let mut link = session.open_cbs_link().await?;
    let outcome = run_candidates(
        link.as_mut(),
        audience,
        token,
        token_types,
        response_timeout,
        cancel,
    )
    .await;
    if let Err(err) = link.close().await {
        tracing::debug!("closing $cbs link failed: {err}");
    }
    outcome
}

async fn run_candidates(
    link: &mut dyn CbsLink,
    audience: &str,
    token: &str,
    token_types: &[String],
    response_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), AuthError> {
    link.set_credit(CBS_REPLY_CREDIT).await?;

    let expiration = chrono::Utc::now().timestamp()
        + i64::try_from(TOKEN_LIFETIME.as_secs()).unwrap_or(3600);
    let mut denied: Option<i32> = None;

    for token_type in token_types {
        let request = CbsRequest {
            message_id: uuid::Uuid::new_v4().to_string(),
            token_type: token_type.clone(),
            audience: audience.to_string(),
            expiration,
            token: token.to_string(),
        };
        let started = Instant::now();

        match try_candidate(link, &request, response_timeout, cancel).await? {
            CandidateResult::Accepted => {
                tracing::info!(
                    audience,
                    token_type = %token_type,
                    elapsed_ms = started.elapsed().as_millis(),
                    "CBS put-token accepted"
                );
                return Ok(());
            }
            CandidateResult::Refused(status) => {
                tracing::warn!(audience, token_type = %token_type, status, "CBS put-token refused");
                if is_denied(status) {
                    denied = Some(status);
                }
            }
            CandidateResult::NoReply => {
                tracing::warn!(
                    audience,
                    token_type = %token_type,
                    elapsed_ms = started.elapsed().as_millis(),
                    "no CBS reply before deadline"
                );
            }
        }
    }

    match denied {
        Some(status) => Err(AuthError::Unauthorized(format!(
            "CBS put-token for {audience} returned status {status}"
        ))),
        None => Err(AuthError::NotAcknowledged {
            audience: audience.to_string(),
            tried: token_types.join(", "),
        }),
    }
}

async fn try_candidate(
    link: &mut dyn CbsLink,
    request: &CbsRequest,
    response_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CandidateResult, AuthError> {
    link.send_request(request).await?;

    let deadline = Instant::now() + response_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(CandidateResult::NoReply);
        }

        let received = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            received = link.recv_response(remaining) => received?,
        };
        let Some(response) = received else {
            continue;
        };

        if response.correlation_id.as_deref() != Some(request.message_id.as_str()) {
            tracing::debug!(
                correlation_id = ?response.correlation_id,
                "ignoring CBS reply for another request"
            );
            continue;
        }

        match response.status_code {
            Some(status) if is_success(status) => {
                if let Err(err) = link.accept(&response).await {
                    tracing::debug!("accepting CBS reply failed: {err}");
                }
                return Ok(CandidateResult::Accepted);
            }
            Some(status) => return Ok(CandidateResult::Refused(status)),
            None => {
                tracing::debug!(
                    description = ?response.status_description,
                    "CBS reply without status code"
                );
            }
        }
    }
}
