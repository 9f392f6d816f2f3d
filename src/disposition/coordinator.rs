//! Chooses a strategy per selector and aggregates outcomes.

use super::lock_batch::{dispose_by_sequence, LockDisposition, LockLimits};
use super::raw_browse::{browse_and_settle, RawBrowseSettings};
use super::{
    DispositionError, Resubmitter, PROP_DEAD_LETTER_DESCRIPTION, PROP_DEAD_LETTER_REASON,
    PROP_REJECTED_AT, PROP_REJECTED_BY,
};
use crate::auth::identity::resolve_actor;
use crate::auth::Credential;
use crate::model::{
    DispositionOutcome, EntityRef, MessageDescriptor, PropertyValue, SubQueue, TargetSelector,
};
use crate::transport::{bounded, within, Broker, Connector, DeadLetterDetails};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Largest head peek used to re-derive a lock-batch size.
pub const HEAD_PEEK_CAP: u32 = 250;

/// What to do with each selected message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Dead-letter from the active entity.
    Reject { reason: String, description: String },
    /// Send a copy of the dead-lettered message back, then complete the copy.
    Resubmit,
    /// Complete the dead-lettered copy.
    Delete,
}

impl Mode {
    pub fn source(&self) -> SubQueue {
        match self {
            Self::Reject { .. } => SubQueue::Active,
            Self::Resubmit | Self::Delete => SubQueue::DeadLetter,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Reject { .. } => "reject",
            Self::Resubmit => "resubmit",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LockBatch,
    RawBrowse,
}

/// Sessionful dead-letter sub-queues need the raw path; everything else locks.
pub fn select_strategy(entity: &EntityRef, mode: &Mode) -> Strategy {
    match (mode.source(), entity.session_enabled) {
        (SubQueue::DeadLetter, true) => Strategy::RawBrowse,
        _ => Strategy::LockBatch,
    }
}

/// Batch size that reaches `selector` given the messages in front of it.
///
/// With `session_bound` only messages of the selector's session count.
pub fn batch_size_for(
    page: &[MessageDescriptor],
    selector: &TargetSelector,
    session_bound: bool,
) -> Option<u32> {
    page.iter()
        .filter(|m| !session_bound || m.session_id == selector.session_id)
        .position(|m| m.sequence_number == selector.sequence_number)
        .map(|index| u32::try_from(index + 1).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub lock_timeout: Duration,
    /// Limit for each attach, settle, send and close call.
    pub settle_timeout: Duration,
    pub raw: RawBrowseSettings,
}

/// Aggregate result of a multi-selector command.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub unauthorized: bool,
    pub outcomes: Vec<DispositionOutcome>,
}

impl Summary {
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

pub struct Coordinator {
    broker: Arc<dyn Broker>,
    connector: Arc<dyn Connector>,
    credential: Credential,
    settings: CoordinatorSettings,
    cancel: CancellationToken,
    actor: OnceCell<String>,
}

impl Coordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        connector: Arc<dyn Connector>,
        credential: Credential,
        settings: CoordinatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            connector,
            credential,
            settings,
            cancel,
            actor: OnceCell::new(),
        }
    }

    /// Identity recorded as `RejectedBy`; resolved once per coordinator.
    pub async fn actor(&self) -> &str {
        self.actor
            .get_or_init(|| resolve_actor(&self.credential))
            .await
            .as_str()
    }

    /// Dispose one selector. Never fails as a whole; errors become the outcome.
    pub async fn dispose(
        &self,
        entity: &EntityRef,
        selector: &TargetSelector,
        mode: &Mode,
        page: &[MessageDescriptor],
    ) -> Result<(), DispositionError> {
        let started = Instant::now();
        let strategy = select_strategy(entity, mode);
        tracing::info!(
            entity = %entity,
            sequence = selector.sequence_number,
            session = ?selector.session_id,
            mode = mode.verb(),
            ?strategy,
            "disposing"
        );

        let result = match strategy {
            Strategy::RawBrowse => self.dispose_raw(entity, selector, mode, page).await,
            Strategy::LockBatch => self.dispose_locked(entity, selector, mode, page).await,
        };

        match &result {
            Ok(()) => tracing::info!(
                sequence = selector.sequence_number,
                elapsed_ms = started.elapsed().as_millis(),
                "{} succeeded",
                mode.verb()
            ),
            Err(err) => tracing::warn!(
                sequence = selector.sequence_number,
                elapsed_ms = started.elapsed().as_millis(),
                "{} failed: {err}",
                mode.verb()
            ),
        }
        result
    }

    /// Dispose each selector independently.
    pub async fn dispose_all(
        &self,
        entity: &EntityRef,
        selectors: &[TargetSelector],
        mode: &Mode,
        page: &[MessageDescriptor],
    ) -> Summary {
        let mut summary = Summary::default();
        for selector in selectors {
            if self.cancel.is_cancelled() {
                summary.failed += 1;
                summary.outcomes.push(DispositionOutcome::failure(
                    selector.clone(),
                    DispositionError::Cancelled.to_string(),
                ));
                continue;
            }
            match self.dispose(entity, selector, mode, page).await {
                Ok(()) => {
                    summary.succeeded += 1;
                    summary.outcomes.push(DispositionOutcome::success(selector.clone()));
                }
                Err(err) => {
                    summary.failed += 1;
                    summary.unauthorized |= err.is_unauthorized();
                    summary
                        .outcomes
                        .push(DispositionOutcome::failure(selector.clone(), err.to_string()));
                }
            }
        }
        summary
    }

    async fn dispose_raw(
        &self,
        entity: &EntityRef,
        selector: &TargetSelector,
        mode: &Mode,
        page: &[MessageDescriptor],
    ) -> Result<(), DispositionError> {
        let hint = u32::try_from(page.len()).unwrap_or(u32::MAX).max(1);
        let resubmitter = self.resubmitter(entity);
        let hook: Option<&dyn super::BeforeSettle> = match mode {
            Mode::Resubmit => Some(&resubmitter),
            _ => None,
        };

        let started = Instant::now();
        let found = browse_and_settle(
            self.connector.as_ref(),
            entity,
            selector.session_id.as_deref(),
            selector.sequence_number,
            hint,
            &self.credential,
            &self.settings.raw,
            hook,
            &self.cancel,
        )
        .await?;

        if found {
            Ok(())
        } else {
            Err(DispositionError::NotFound {
                sequence: selector.sequence_number,
                passes: super::attempt_plan(hint).len(),
                elapsed_ms: started.elapsed().as_millis(),
            })
        }
    }

    fn resubmitter<'a>(&'a self, entity: &'a EntityRef) -> Resubmitter<'a> {
        Resubmitter {
            broker: self.broker.as_ref(),
            send_path: entity.send_path(),
            timeout: self.settings.settle_timeout,
            cancel: &self.cancel,
        }
    }

    async fn reject_details(&self, reason: &str, description: &str) -> DeadLetterDetails {
        let mut properties = BTreeMap::new();
        properties.insert(
            PROP_DEAD_LETTER_REASON.to_string(),
            PropertyValue::from(reason),
        );
        properties.insert(
            PROP_DEAD_LETTER_DESCRIPTION.to_string(),
            PropertyValue::from(description),
        );
        properties.insert(
            PROP_REJECTED_BY.to_string(),
            PropertyValue::from(self.actor().await),
        );
        properties.insert(
            PROP_REJECTED_AT.to_string(),
            PropertyValue::String(Utc::now().to_rfc3339()),
        );
        DeadLetterDetails {
            reason: reason.to_string(),
            description: description.to_string(),
            properties,
        }
    }

    async fn dispose_locked(
        &self,
        entity: &EntityRef,
        selector: &TargetSelector,
        mode: &Mode,
        page: &[MessageDescriptor],
    ) -> Result<(), DispositionError> {
        let address = entity.address(mode.source());
        // Sub-queues reject session filters; only the active entity binds a session.
        let bound_session = match mode.source() {
            SubQueue::Active if entity.session_enabled => selector.session_id.as_deref(),
            _ => None,
        };

        let resubmitter = self.resubmitter(entity);
        let disposition = match mode {
            Mode::Reject {
                reason,
                description,
            } => LockDisposition::DeadLetter(self.reject_details(reason, description).await),
            Mode::Delete => LockDisposition::Complete,
            Mode::Resubmit => LockDisposition::CompleteAfter(&resubmitter),
        };

        let batch_size =
            batch_size_for(page, selector, bound_session.is_some()).unwrap_or(1);
        match self
            .lock_attempt(&address, bound_session, selector, batch_size, &disposition)
            .await
        {
            Err(DispositionError::TargetNotInBatch) => {}
            other => return other,
        }

        let head = bounded(
            "head peek",
            self.settings.settle_timeout,
            &self.cancel,
            self.broker.peek(&address, 1, HEAD_PEEK_CAP),
        )
        .await?;
        let Some(batch_size) = batch_size_for(&head, selector, bound_session.is_some()) else {
            return Err(DispositionError::TargetNotInBatch);
        };
        tracing::debug!(
            sequence = selector.sequence_number,
            batch_size,
            "retrying with batch size from head peek"
        );
        self.lock_attempt(&address, bound_session, selector, batch_size, &disposition)
            .await
    }

    async fn lock_attempt(
        &self,
        address: &str,
        session_id: Option<&str>,
        selector: &TargetSelector,
        batch_size: u32,
        disposition: &LockDisposition<'_>,
    ) -> Result<(), DispositionError> {
        let limits = LockLimits {
            receive: self.settings.lock_timeout,
            settle: self.settings.settle_timeout,
        };
        let mut receiver = bounded(
            "lock receiver attach",
            limits.settle,
            &self.cancel,
            self.broker.open_lock_receiver(address, session_id),
        )
        .await?;
        let result = dispose_by_sequence(
            receiver.as_mut(),
            selector.sequence_number,
            batch_size,
            disposition,
            limits,
            &self.cancel,
        )
        .await
        .map(|_| ());
        if let Err(err) = within("lock receiver close", limits.settle, receiver.close()).await {
            tracing::debug!(address, "closing lock receiver failed: {err}");
        }
        result
    }
}
