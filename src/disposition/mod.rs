//! Sequence-addressed message disposition.
//!
//! The broker offers no "receive message N" primitive, so a target is located
//! either by receiving a small locked batch ([`lock_batch`]) or, for sessionful
//! dead-letter sub-queues, by browsing an unfiltered link and matching on the
//! sequence-number annotation ([`raw_browse`]). [`coordinator`] picks between
//! them.

pub mod browser;
pub mod coordinator;
pub mod lock_batch;
pub mod raw_browse;

pub use browser::{browse, BrowseAttempt, OnMatch};
pub use coordinator::{select_strategy, Coordinator, CoordinatorSettings, Mode, Strategy, Summary};
pub use lock_batch::{dispose_by_sequence, LockDisposition, LockLimits};
pub use raw_browse::{attempt_plan, browse_and_complete, browse_and_settle, RawBrowseSettings};

use crate::auth::AuthError;
use crate::model::{BodySection, MessageDescriptor, OutboundMessage, PropertyValue};
use crate::transport::{bounded, Broker, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Application property names this tool writes when rejecting.
pub const PROP_DEAD_LETTER_REASON: &str = "DeadLetterReason";
pub const PROP_DEAD_LETTER_DESCRIPTION: &str = "DeadLetterErrorDescription";
pub const PROP_REJECTED_BY: &str = "RejectedBy";
pub const PROP_REJECTED_AT: &str = "RejectedAt";
/// Stamped on resubmitted copies.
pub const PROP_ORIGINAL_SEQUENCE: &str = "OriginalSequenceNumber";

const INJECTED_PROPERTIES: [&str; 4] = [
    PROP_DEAD_LETTER_REASON,
    PROP_DEAD_LETTER_DESCRIPTION,
    PROP_REJECTED_BY,
    PROP_REJECTED_AT,
];

#[derive(Debug, Error)]
pub enum DispositionError {
    #[error("no messages available")]
    NoMessages,
    #[error("target not in current page")]
    TargetNotInBatch,
    #[error("sequence {sequence} not found after {passes} browse passes ({elapsed_ms} ms)")]
    NotFound {
        sequence: i64,
        passes: usize,
        elapsed_ms: u128,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("resubmit send failed: {0}")]
    SendFailed(#[source] TransportError),
    #[error("{0} body cannot be resent unchanged")]
    UnsupportedBody(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Auth(AuthError),
}

impl From<TransportError> for DispositionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => Self::Cancelled,
            TransportError::Unauthorized(msg) => Self::Unauthorized(msg),
            other => Self::Transport(other),
        }
    }
}

impl From<AuthError> for DispositionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Transport(inner) => inner.into(),
            AuthError::Unauthorized(msg) => Self::Unauthorized(msg),
            other => Self::Auth(other),
        }
    }
}

impl DispositionError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::SendFailed(err) | Self::Transport(err) => err.is_unauthorized(),
            Self::Auth(err) => err.is_unauthorized(),
            _ => false,
        }
    }
}

/// Runs after the target is located and before it is settled.
///
/// An error leaves the target unsettled and is reported as the outcome.
#[async_trait]
pub trait BeforeSettle: Send + Sync {
    async fn before_settle(&self, target: &MessageDescriptor) -> Result<(), DispositionError>;
}

/// Sends a fresh copy of the target to `send_path`.
pub struct Resubmitter<'a> {
    pub broker: &'a dyn Broker,
    pub send_path: &'a str,
    /// Limit for the send; the target stays locked while it runs.
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
impl BeforeSettle for Resubmitter<'_> {
    async fn before_settle(&self, target: &MessageDescriptor) -> Result<(), DispositionError> {
        if let BodySection::Opaque(kind) = &target.body_section {
            return Err(DispositionError::UnsupportedBody(kind.clone()));
        }
        let outbound = resubmission_of(target, Utc::now());
        match bounded(
            "resubmit send",
            self.timeout,
            self.cancel,
            self.broker.send(self.send_path, outbound),
        )
        .await
        {
            Ok(()) => {}
            Err(TransportError::Cancelled) => return Err(DispositionError::Cancelled),
            Err(err) => return Err(DispositionError::SendFailed(err)),
        }
        tracing::info!(
            sequence = target.sequence_number,
            entity = self.send_path,
            "resubmitted copy sent"
        );
        Ok(())
    }
}

/// Build the message sent when resubmitting `source`.
pub fn resubmission_of(source: &MessageDescriptor, now: DateTime<Utc>) -> OutboundMessage {
    let mut application_properties = source.application_properties.clone();
    application_properties.retain(|key, _| !INJECTED_PROPERTIES.contains(&key.as_str()));
    application_properties.insert(
        PROP_ORIGINAL_SEQUENCE.to_string(),
        PropertyValue::Long(source.sequence_number),
    );

    OutboundMessage {
        body: source.body.clone(),
        body_section: source.body_section.clone(),
        content_type: source.content_type.clone(),
        subject: source.subject.clone(),
        message_id: source.message_id.clone(),
        correlation_id: source.correlation_id.clone(),
        session_id: source.session_id.clone(),
        reply_to: source.reply_to.clone(),
        reply_to_session_id: source.reply_to_session_id.clone(),
        partition_key: source.partition_key.clone(),
        time_to_live: source.remaining_ttl(now),
        application_properties,
    }
}
