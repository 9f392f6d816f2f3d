//! Domain model shared by the transport, disposition engine and pager.
//!
//! Everything here is a plain value: entities are resolved once by the caller,
//! message descriptors are read-only snapshots, and dispositions always build a
//! fresh [`OutboundMessage`] instead of mutating a descriptor in place.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Address suffix of every entity's dead-letter sub-queue.
pub const DEAD_LETTER_SUFFIX: &str = "/$DeadLetterQueue";

/// Annotation key carrying the broker-assigned sequence number.
pub const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
/// Annotation key carrying the enqueue timestamp.
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";
/// Annotation key carrying the partition key.
pub const PARTITION_KEY_ANNOTATION: &str = "x-opt-partition-key";
/// Annotation key carrying the locked-until timestamp.
pub const LOCKED_UNTIL_ANNOTATION: &str = "x-opt-locked-until";

// ── Entities ─────────────────────────────────────────────────────

/// Kind of broker entity that holds messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Queue,
    TopicSubscription,
}

/// Which queue of an entity an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubQueue {
    #[default]
    Active,
    DeadLetter,
}

/// A resolved queue or topic subscription.
///
/// `path` is the broker path: `<queue>` or `<topic>/Subscriptions/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub path: String,
    pub session_enabled: bool,
}

impl EntityRef {
    pub fn queue(name: impl Into<String>, session_enabled: bool) -> Self {
        Self {
            kind: EntityKind::Queue,
            path: name.into(),
            session_enabled,
        }
    }

    pub fn subscription(topic: &str, subscription: &str, session_enabled: bool) -> Self {
        Self {
            kind: EntityKind::TopicSubscription,
            path: format!("{topic}/Subscriptions/{subscription}"),
            session_enabled,
        }
    }

    /// Link address for the requested sub-queue.
    pub fn address(&self, sub_queue: SubQueue) -> String {
        match sub_queue {
            SubQueue::Active => self.path.clone(),
            SubQueue::DeadLetter => format!("{}{DEAD_LETTER_SUFFIX}", self.path),
        }
    }

    /// Path that new messages are sent to.
    ///
    /// Subscriptions cannot be sent to directly; their parent topic is used.
    pub fn send_path(&self) -> &str {
        match self.kind {
            EntityKind::Queue => &self.path,
            EntityKind::TopicSubscription => self
                .path
                .split_once('/')
                .map_or(self.path.as_str(), |(topic, _)| topic),
        }
    }

    pub fn display_name(&self) -> String {
        match self.kind {
            EntityKind::Queue => format!("Queue {}", self.path),
            EntityKind::TopicSubscription => format!("Subscription {}", self.path),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

// ── Messages ─────────────────────────────────────────────────────

/// An application property value as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%SZ")),
            Self::Binary(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

/// Wire shape of a message body.
///
/// [`MessageDescriptor::body`] is a displayable byte view; this keeps what is
/// needed to send the body again in its original form.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BodySection {
    /// `data` sections, concatenated into `body`.
    #[default]
    Data,
    /// A single `amqp-value` section in its encoded form.
    Value(Vec<u8>),
    /// `amqp-sequence` sections, each encoded as a list.
    Sequence(Vec<Vec<u8>>),
    /// A section that could not be captured, named by kind.
    Opaque(String),
}

/// Read-only snapshot of a message produced by peek, browse or receive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageDescriptor {
    pub sequence_number: i64,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub content_type: Option<String>,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub time_to_live: Option<Duration>,
    pub delivery_count: u32,
    pub body: Vec<u8>,
    pub body_section: BodySection,
    pub application_properties: BTreeMap<String, PropertyValue>,
}

impl MessageDescriptor {
    /// Convenience constructor used heavily by tests and fakes.
    pub fn new(sequence_number: i64) -> Self {
        Self {
            sequence_number,
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Remaining time-to-live measured against `now`, if the broker told us
    /// when the message expires. `None` means "no expiry known".
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at.or_else(|| {
            let ttl = chrono::Duration::from_std(self.time_to_live?).ok()?;
            self.enqueued_time.map(|enqueued| enqueued + ttl)
        })?;
        (expires_at - now).to_std().ok()
    }
}

/// A message to be sent. Always built fresh, never derived by mutation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub body_section: BodySection,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub application_properties: BTreeMap<String, PropertyValue>,
}

// ── Targets and outcomes ─────────────────────────────────────────

/// Unit of work for a disposition command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSelector {
    pub sequence_number: i64,
    pub session_id: Option<String>,
}

impl TargetSelector {
    pub fn new(sequence_number: i64) -> Self {
        Self {
            sequence_number,
            session_id: None,
        }
    }

    pub fn in_session(sequence_number: i64, session_id: impl Into<String>) -> Self {
        Self {
            sequence_number,
            session_id: Some(session_id.into()),
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session) => write!(f, "#{} (session {session})", self.sequence_number),
            None => write!(f, "#{}", self.sequence_number),
        }
    }
}

/// Result of disposing a single selector.
#[derive(Debug, Clone, PartialEq)]
pub struct DispositionOutcome {
    pub selector: TargetSelector,
    pub ok: bool,
    pub error: Option<String>,
}

impl DispositionOutcome {
    pub fn success(selector: TargetSelector) -> Self {
        Self {
            selector,
            ok: true,
            error: None,
        }
    }

    pub fn failure(selector: TargetSelector, error: impl Into<String>) -> Self {
        Self {
            selector,
            ok: false,
            error: Some(error.into()),
        }
    }
}

// ── Annotation parsing ───────────────────────────────────────────

/// Transport-neutral view of an annotation value.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Long(i64),
    Int(i32),
    ULong(u64),
    UInt(u32),
    Decimal(f64),
    String(String),
    Other,
}

/// Interpret a sequence-number annotation.
///
/// The broker sends a 64-bit integer; the other encodings are accepted
/// defensively and never relied upon.
pub fn sequence_from_annotation(value: &AnnotationValue) -> Option<i64> {
    match value {
        AnnotationValue::Long(v) => Some(*v),
        AnnotationValue::Int(v) => Some(i64::from(*v)),
        AnnotationValue::ULong(v) => i64::try_from(*v).ok(),
        AnnotationValue::UInt(v) => Some(i64::from(*v)),
        #[allow(clippy::cast_possible_truncation)]
        AnnotationValue::Decimal(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
        AnnotationValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
