//! Receive a locked batch, settle the target, abandon the rest.

use super::{BeforeSettle, DispositionError};
use crate::model::MessageDescriptor;
use crate::transport::{bounded, within, DeadLetterDetails, LockReceiver, LockedMessage};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default wait for the broker to hand out locks.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default limit for a single settle or abandon call.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadlines for one lock-batch attempt.
#[derive(Debug, Clone, Copy)]
pub struct LockLimits {
    /// Wait for the broker to hand out locks.
    pub receive: Duration,
    /// Limit for each settle and abandon call.
    pub settle: Duration,
}

impl Default for LockLimits {
    fn default() -> Self {
        Self {
            receive: LOCK_TIMEOUT,
            settle: SETTLE_TIMEOUT,
        }
    }
}

/// How the located target is settled.
pub enum LockDisposition<'a> {
    Complete,
    DeadLetter(DeadLetterDetails),
    /// Run the hook first; complete only if it succeeded.
    CompleteAfter(&'a dyn BeforeSettle),
}

async fn settle_target(
    receiver: &mut dyn LockReceiver,
    target: &LockedMessage,
    disposition: &LockDisposition<'_>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<(), DispositionError> {
    match disposition {
        LockDisposition::Complete => {
            bounded("complete", limit, cancel, receiver.complete(target)).await?;
        }
        LockDisposition::DeadLetter(details) => {
            bounded("dead-letter", limit, cancel, receiver.dead_letter(target, details)).await?;
        }
        LockDisposition::CompleteAfter(hook) => {
            hook.before_settle(&target.message).await?;
            bounded("complete", limit, cancel, receiver.complete(target)).await?;
        }
    }
    Ok(())
}

/// Locate `sequence` in a batch of up to `batch_size` locked messages and
/// settle it with `disposition`.
///
/// Every other message in the batch is abandoned regardless of how the
/// target fared; so is the target itself if settling it failed. Abandon
/// failures are logged and swallowed. Abandons run even after `cancel`
/// fires, each bounded by `limits.settle`.
pub async fn dispose_by_sequence(
    receiver: &mut dyn LockReceiver,
    sequence: i64,
    batch_size: u32,
    disposition: &LockDisposition<'_>,
    limits: LockLimits,
    cancel: &CancellationToken,
) -> Result<MessageDescriptor, DispositionError> {
    let batch = bounded(
        "lock receive",
        limits.receive + limits.settle,
        cancel,
        receiver.receive_batch(batch_size.max(1), limits.receive),
    )
    .await?;
    if batch.is_empty() {
        return Err(DispositionError::NoMessages);
    }

    let target = batch
        .iter()
        .position(|locked| locked.message.sequence_number == sequence);

    let result = match target {
        Some(index) => {
            settle_target(receiver, &batch[index], disposition, limits.settle, cancel).await
        }
        None => Err(DispositionError::TargetNotInBatch),
    };

    for (index, locked) in batch.iter().enumerate() {
        if Some(index) == target && result.is_ok() {
            continue;
        }
        if let Err(err) = within("abandon", limits.settle, receiver.abandon(locked)).await {
            tracing::debug!(
                sequence = locked.message.sequence_number,
                "abandon failed: {err}"
            );
        }
    }

    match (result, target) {
        (Ok(()), Some(index)) => {
            tracing::info!(sequence, batch = batch.len(), "target settled");
            Ok(batch[index].message.clone())
        }
        (Err(err), _) => {
            tracing::warn!(sequence, batch = batch.len(), "disposition failed: {err}");
            Err(err)
        }
        (Ok(()), None) => Err(DispositionError::TargetNotInBatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingReceiver {
        queued: Vec<i64>,
        completed: Vec<i64>,
        dead_lettered: Vec<i64>,
        abandoned: Vec<i64>,
        fail_dead_letter: bool,
        hang_settle: bool,
    }

    #[async_trait]
    impl LockReceiver for RecordingReceiver {
        async fn receive_batch(
            &mut self,
            max: u32,
            _wait: Duration,
        ) -> Result<Vec<LockedMessage>, TransportError> {
            let take = self.queued.len().min(max as usize);
            Ok(self
                .queued
                .drain(..take)
                .enumerate()
                .map(|(i, seq)| LockedMessage {
                    lock_id: i as u64,
                    message: MessageDescriptor::new(seq),
                })
                .collect())
        }

        async fn complete(&mut self, m: &LockedMessage) -> Result<(), TransportError> {
            if self.hang_settle {
                std::future::pending::<()>().await;
            }
            self.completed.push(m.message.sequence_number);
            Ok(())
        }

        async fn dead_letter(
            &mut self,
            m: &LockedMessage,
            _details: &DeadLetterDetails,
        ) -> Result<(), TransportError> {
            if self.hang_settle {
                std::future::pending::<()>().await;
            }
            if self.fail_dead_letter {
                return Err(TransportError::Disconnected("link detached".into()));
            }
            self.dead_lettered.push(m.message.sequence_number);
            Ok(())
        }

        async fn abandon(&mut self, m: &LockedMessage) -> Result<(), TransportError> {
            self.abandoned.push(m.message.sequence_number);
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn receiver(queued: &[i64]) -> RecordingReceiver {
        RecordingReceiver {
            queued: queued.to_vec(),
            ..RecordingReceiver::default()
        }
    }

    #[tokio::test]
    async fn target_is_dead_lettered_and_rest_abandoned() {
        let mut rx = receiver(&[10, 11, 12]);
        let cancel = CancellationToken::new();
        let disposition = LockDisposition::DeadLetter(DeadLetterDetails::default());

        let settled = dispose_by_sequence(&mut rx, 11, 3, &disposition, LockLimits::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(settled.sequence_number, 11);
        assert_eq!(rx.dead_lettered, vec![11]);
        assert_eq!(rx.abandoned, vec![10, 12]);
    }

    #[tokio::test]
    async fn absent_target_dead_letters_nothing() {
        let mut rx = receiver(&[10, 11]);
        let cancel = CancellationToken::new();
        let disposition = LockDisposition::DeadLetter(DeadLetterDetails::default());

        let err = dispose_by_sequence(&mut rx, 99, 2, &disposition, LockLimits::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DispositionError::TargetNotInBatch));
        assert!(rx.dead_lettered.is_empty());
        assert!(rx.completed.is_empty());
        assert_eq!(rx.abandoned, vec![10, 11]);
    }

    #[tokio::test]
    async fn empty_entity_reports_no_messages() {
        let mut rx = receiver(&[]);
        let cancel = CancellationToken::new();
        let err = dispose_by_sequence(&mut rx, 1, 1, &LockDisposition::Complete, LockLimits::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispositionError::NoMessages));
    }

    #[tokio::test]
    async fn failed_target_still_abandons_everything() {
        let mut rx = receiver(&[1, 2, 3]);
        rx.fail_dead_letter = true;
        let cancel = CancellationToken::new();
        let disposition = LockDisposition::DeadLetter(DeadLetterDetails::default());

        let err = dispose_by_sequence(&mut rx, 2, 3, &disposition, LockLimits::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DispositionError::Transport(_)));
        assert_eq!(rx.abandoned, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn zero_batch_size_still_receives_one() {
        let mut rx = receiver(&[5, 6]);
        let cancel = CancellationToken::new();
        dispose_by_sequence(&mut rx, 5, 0, &LockDisposition::Complete, LockLimits::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(rx.completed, vec![5]);
        assert!(rx.abandoned.is_empty());
        assert_eq!(rx.queued, vec![6]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_settle_times_out_and_abandons_the_target() {
        let mut rx = receiver(&[1, 2]);
        rx.hang_settle = true;
        let cancel = CancellationToken::new();
        let limits = LockLimits {
            receive: Duration::from_secs(1),
            settle: Duration::from_secs(3),
        };
        let disposition = LockDisposition::DeadLetter(DeadLetterDetails::default());

        let err = dispose_by_sequence(&mut rx, 2, 2, &disposition, limits, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispositionError::Transport(TransportError::Timeout { .. })
        ));
        assert!(rx.dead_lettered.is_empty());
        assert_eq!(rx.abandoned, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_settle_still_abandons_the_batch() {
        let mut rx = receiver(&[7, 8]);
        rx.hang_settle = true;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = dispose_by_sequence(
            &mut rx,
            7,
            2,
            &LockDisposition::Complete,
            LockLimits::default(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DispositionError::Cancelled));
        assert!(started.elapsed() < SETTLE_TIMEOUT);
        assert_eq!(rx.abandoned, vec![7, 8]);
    }
}
