//! Sequence-number paging over a peekable entity.
//!
//! The pager tracks the first sequence of the displayed window, the next
//! unseen sequence, and a stack of earlier window starts for going back.

use crate::model::MessageDescriptor;
use crate::transport::{Broker, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

/// Upper bound on fetches spent filling one filtered page.
pub const MAX_FILL_ROUNDS: usize = 8;

/// Where pages come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// At most `count` messages, strictly increasing, all `>= from_sequence`.
    async fn fetch_page(
        &self,
        from_sequence: i64,
        count: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError>;

    /// The message with exactly this sequence number, if it exists.
    async fn find_by_sequence(
        &self,
        sequence: i64,
    ) -> Result<Option<MessageDescriptor>, TransportError>;
}

/// Enforce the page contract on whatever the broker returned.
pub fn sanitize_page(
    messages: Vec<MessageDescriptor>,
    from_sequence: i64,
    count: u32,
) -> Vec<MessageDescriptor> {
    let mut last = from_sequence - 1;
    let mut page = Vec::with_capacity(messages.len().min(count as usize));
    for message in messages {
        if page.len() >= count as usize {
            break;
        }
        if message.sequence_number > last {
            last = message.sequence_number;
            page.push(message);
        }
    }
    page
}

/// [`PageSource`] backed by broker peeks on one address.
pub struct BrokerPageSource {
    broker: Arc<dyn Broker>,
    address: String,
}

impl BrokerPageSource {
    pub fn new(broker: Arc<dyn Broker>, address: impl Into<String>) -> Self {
        Self {
            broker,
            address: address.into(),
        }
    }
}

#[async_trait]
impl PageSource for BrokerPageSource {
    async fn fetch_page(
        &self,
        from_sequence: i64,
        count: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let peeked = self.broker.peek(&self.address, from_sequence, count).await?;
        Ok(sanitize_page(peeked, from_sequence, count))
    }

    async fn find_by_sequence(
        &self,
        sequence: i64,
    ) -> Result<Option<MessageDescriptor>, TransportError> {
        let peeked = self.broker.peek(&self.address, sequence, 1).await?;
        Ok(peeked.into_iter().find(|m| m.sequence_number == sequence))
    }
}

/// Cursor over a [`PageSource`].
pub struct SequencePager<S> {
    source: S,
    page_size: u32,
    session_prefix: Option<String>,
    window_start: i64,
    next_from_sequence: i64,
    history: Vec<i64>,
    current: Vec<MessageDescriptor>,
}

impl<S: PageSource> SequencePager<S> {
    pub fn new(source: S, page_size: u32) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            session_prefix: None,
            window_start: 1,
            next_from_sequence: 1,
            history: Vec::new(),
            current: Vec::new(),
        }
    }

    /// Only show messages whose session id starts with `prefix`.
    pub fn with_session_prefix(mut self, prefix: Option<String>) -> Self {
        self.session_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    pub fn next_from_sequence(&self) -> i64 {
        self.next_from_sequence
    }

    pub fn current(&self) -> &[MessageDescriptor] {
        &self.current
    }

    pub fn can_go_back(&self) -> bool {
        !self.history.is_empty() || self.window_start > 1
    }

    fn accepts(&self, message: &MessageDescriptor) -> bool {
        match &self.session_prefix {
            None => true,
            Some(prefix) => message
                .session_id
                .as_deref()
                .is_some_and(|id| id.starts_with(prefix.as_str())),
        }
    }

    /// Fill one page from `from`; returns the page and the next unseen sequence.
    async fn fill(&self, from: i64) -> Result<(Vec<MessageDescriptor>, i64), TransportError> {
        let wanted = self.page_size as usize;
        let mut items = Vec::with_capacity(wanted);
        let mut cursor = from;

        for _ in 0..MAX_FILL_ROUNDS {
            let batch = self.source.fetch_page(cursor, self.page_size).await?;
            if batch.is_empty() {
                break;
            }
            for message in batch {
                cursor = cursor.max(message.sequence_number + 1);
                if self.accepts(&message) {
                    items.push(message);
                    if items.len() == wanted {
                        return Ok((items, cursor));
                    }
                }
            }
            if self.session_prefix.is_none() {
                break;
            }
        }
        Ok((items, cursor))
    }

    async fn load(&mut self, from: i64) -> Result<&[MessageDescriptor], TransportError> {
        let (items, next) = self.fill(from).await?;
        self.window_start = items.first().map_or(from, |m| m.sequence_number);
        self.next_from_sequence = next;
        self.current = items;
        Ok(&self.current)
    }

    /// Load the first window and forget history.
    pub async fn first_page(&mut self) -> Result<&[MessageDescriptor], TransportError> {
        self.history.clear();
        self.load(1).await
    }

    /// Load the window starting at `from`, keeping the current one in history.
    pub async fn page_from(&mut self, from: i64) -> Result<&[MessageDescriptor], TransportError> {
        self.history.push(self.window_start);
        self.load(from.max(1)).await
    }

    /// Advance past the last message examined. At the end of the entity the
    /// current window is kept and an empty slice is returned.
    pub async fn next_page(&mut self) -> Result<&[MessageDescriptor], TransportError> {
        let (items, next) = self.fill(self.next_from_sequence).await?;
        if items.is_empty() {
            self.next_from_sequence = next;
            return Ok(&[]);
        }
        self.history.push(self.window_start);
        self.window_start = items[0].sequence_number;
        self.next_from_sequence = next;
        self.current = items;
        Ok(&self.current)
    }

    /// Return to the previous window, or estimate one when history is empty.
    pub async fn prev_page(&mut self) -> Result<&[MessageDescriptor], TransportError> {
        let start = match self.history.pop() {
            Some(start) => start,
            None => {
                let first_visible = self
                    .current
                    .first()
                    .map_or(self.window_start, |m| m.sequence_number);
                (first_visible - i64::from(self.page_size)).max(1)
            }
        };
        self.load(start).await
    }

    /// Show the window containing `sequence`.
    ///
    /// Returns `None`, leaving the pager untouched, when no message has
    /// exactly that sequence number.
    pub async fn jump_to(
        &mut self,
        sequence: i64,
    ) -> Result<Option<MessageDescriptor>, TransportError> {
        let from = (sequence - i64::from(self.page_size) + 1).max(1);
        let (items, next) = self.fill(from).await?;

        if let Some(found) = items.iter().find(|m| m.sequence_number == sequence).cloned() {
            self.history.push(self.window_start);
            self.window_start = items.first().map_or(from, |m| m.sequence_number);
            self.next_from_sequence = next;
            self.current = items;
            return Ok(Some(found));
        }

        match self.source.find_by_sequence(sequence).await? {
            Some(found) if found.sequence_number == sequence && self.accepts(&found) => {
                self.history.push(self.window_start);
                self.window_start = sequence;
                self.next_from_sequence = sequence + 1;
                self.current = vec![found.clone()];
                Ok(Some(found))
            }
            _ => Ok(None),
        }
    }
}
