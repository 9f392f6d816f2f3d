use crate::model::{MessageDescriptor, OutboundMessage, PropertyValue};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default AMQPS port of the broker.
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Errors raised by any broker-facing call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{operation} failed within deadline: {last_error}")]
    Timeout {
        operation: &'static str,
        last_error: String,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn timeout(operation: &'static str, last_error: impl Into<String>) -> Self {
        Self::Timeout {
            operation,
            last_error: last_error.into(),
        }
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_AMQPS_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// SASL mechanism used when opening a connection.
#[derive(Clone, PartialEq, Eq)]
pub enum SaslMode {
    /// `PLAIN` with the shared access key name and key.
    Plain { username: String, password: String },
    /// `ANONYMOUS`; entity access is granted later over CBS.
    Anonymous,
}

impl std::fmt::Debug for SaslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

// ── Raw link layer ───────────────────────────────────────────────

/// A message delivered on a browse link, still unsettled.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Link-local handle used to settle this delivery.
    pub id: u64,
    pub message: MessageDescriptor,
}

/// A put-token request sent to the `$cbs` node.
#[derive(Debug, Clone, PartialEq)]
pub struct CbsRequest {
    pub message_id: String,
    pub token_type: String,
    pub audience: String,
    /// Expiry as Unix epoch seconds.
    pub expiration: i64,
    pub token: String,
}

/// A message received on the `$cbs` reply link.
#[derive(Debug, Clone, PartialEq)]
pub struct CbsResponse {
    pub delivery_id: u64,
    pub correlation_id: Option<String>,
    pub status_code: Option<i32>,
    pub status_description: Option<String>,
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection plus session. A rejected SASL handshake must be
    /// reported as [`TransportError::Unauthorized`].
    async fn open(
        &self,
        endpoint: &Endpoint,
        sasl: &SaslMode,
    ) -> Result<Box<dyn LinkSession>, TransportError>;
}

/// One connection and session, owned by a single browse or disposition episode.
#[async_trait]
pub trait LinkSession: Send {
    /// Attach a receive link with no session filter and grant `credit` once.
    async fn open_browse_link(
        &mut self,
        address: &str,
        credit: u32,
    ) -> Result<Box<dyn BrowseLink>, TransportError>;

    /// Attach the sender/receiver pair on the reserved `$cbs` node.
    async fn open_cbs_link(&mut self) -> Result<Box<dyn CbsLink>, TransportError>;

    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrowseLink: Send {
    /// Wait up to `wait` for the next delivery.
    async fn recv(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Hand the delivery back to the broker untouched.
    async fn release(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Settle the delivery, removing the message.
    async fn accept(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait CbsLink: Send {
    async fn set_credit(&mut self, credit: u32) -> Result<(), TransportError>;

    async fn send_request(&mut self, request: &CbsRequest) -> Result<(), TransportError>;

    /// Wait up to `wait` for the next reply on the link.
    async fn recv_response(&mut self, wait: Duration)
        -> Result<Option<CbsResponse>, TransportError>;

    async fn accept(&mut self, response: &CbsResponse) -> Result<(), TransportError>;

    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

// ── Entity layer ─────────────────────────────────────────────────

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub lock_id: u64,
    pub message: MessageDescriptor,
}

/// What gets attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeadLetterDetails {
    pub reason: String,
    pub description: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Peek-lock receiver bound to one address (and optionally one session).
#[async_trait]
pub trait LockReceiver: Send {
    /// Receive up to `max` messages, waiting at most `wait` for the first one.
    async fn receive_batch(
        &mut self,
        max: u32,
        wait: Duration,
    ) -> Result<Vec<LockedMessage>, TransportError>;

    async fn complete(&mut self, message: &LockedMessage) -> Result<(), TransportError>;

    async fn dead_letter(
        &mut self,
        message: &LockedMessage,
        details: &DeadLetterDetails,
    ) -> Result<(), TransportError>;

    async fn abandon(&mut self, message: &LockedMessage) -> Result<(), TransportError>;

    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Entity-level operations used by the pager and the lock-batch strategy.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Non-destructive peek of up to `max` messages starting at `from_sequence`.
    async fn peek(
        &self,
        address: &str,
        from_sequence: i64,
        max: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError>;

    async fn open_lock_receiver(
        &self,
        address: &str,
        session_id: Option<&str>,
    ) -> Result<Box<dyn LockReceiver>, TransportError>;

    async fn send(&self, entity_path: &str, message: OutboundMessage)
        -> Result<(), TransportError>;
}
