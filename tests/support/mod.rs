//! In-memory Service Bus double implementing the transport traits.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sbcli::model::{MessageDescriptor, OutboundMessage, PropertyValue, DEAD_LETTER_SUFFIX};
use sbcli::transport::{
    Broker, BrowseLink, CbsLink, CbsRequest, CbsResponse, Connector, DeadLetterDetails, Delivery,
    Endpoint, LinkSession, LockReceiver, LockedMessage, SaslMode, TransportError,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the `$cbs` node answers a put-token of one token type.
#[derive(Debug, Clone, Copy)]
pub enum CbsReply {
    Status(i32),
    /// Never answers.
    Silent,
    /// Answers with this status under somebody else's correlation id.
    Mismatched(i32),
}

#[derive(Debug, Clone)]
struct Stored {
    message: MessageDescriptor,
    locked: bool,
}

#[derive(Default)]
struct State {
    entities: HashMap<String, Vec<Stored>>,
    next_sequence: HashMap<String, i64>,
    sent: Vec<(String, OutboundMessage)>,
    dead_lettered: Vec<(i64, DeadLetterDetails)>,
    fail_sends: bool,
    hang_sends: bool,
    reject_plain: bool,
    cbs_replies: HashMap<String, CbsReply>,
    cbs_requests: Vec<String>,
    sasl_log: Vec<SaslMode>,
}

impl State {
    fn entity(&mut self, address: &str) -> &mut Vec<Stored> {
        self.entities.entry(address.to_string()).or_default()
    }

    fn unlock(&mut self, address: &str, sequence: i64) {
        if let Some(stored) = self
            .entity(address)
            .iter_mut()
            .find(|s| s.message.sequence_number == sequence)
        {
            stored.locked = false;
        }
    }

    fn remove(&mut self, address: &str, sequence: i64) -> Option<MessageDescriptor> {
        let entity = self.entity(address);
        let index = entity
            .iter()
            .position(|s| s.message.sequence_number == sequence)?;
        Some(entity.remove(index).message)
    }

    fn append(&mut self, address: &str, mut message: MessageDescriptor) {
        let next = self.next_sequence.entry(address.to_string()).or_insert(1);
        message.sequence_number = *next;
        *next += 1;
        self.entity(address).push(Stored {
            message,
            locked: false,
        });
    }
}

/// Shared handle; clones see the same namespace.
#[derive(Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<State>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `messages` on `address` as-is, keeping their sequence numbers.
    pub fn seed(&self, address: &str, messages: impl IntoIterator<Item = MessageDescriptor>) {
        let mut state = self.state.lock();
        let mut highest = 0;
        for message in messages {
            highest = highest.max(message.sequence_number);
            state.entity(address).push(Stored {
                message,
                locked: false,
            });
        }
        state
            .entity(address)
            .sort_by_key(|s| s.message.sequence_number);
        let next = state.next_sequence.entry(address.to_string()).or_insert(1);
        *next = (*next).max(highest + 1);
    }

    pub fn sequences(&self, address: &str) -> Vec<i64> {
        self.state
            .lock()
            .entities
            .get(address)
            .map(|e| e.iter().map(|s| s.message.sequence_number).collect())
            .unwrap_or_default()
    }

    pub fn message(&self, address: &str, sequence: i64) -> Option<MessageDescriptor> {
        self.state.lock().entities.get(address).and_then(|e| {
            e.iter()
                .find(|s| s.message.sequence_number == sequence)
                .map(|s| s.message.clone())
        })
    }

    pub fn locked_count(&self) -> usize {
        self.state
            .lock()
            .entities
            .values()
            .flatten()
            .filter(|s| s.locked)
            .count()
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.state.lock().sent.clone()
    }

    pub fn dead_lettered(&self) -> Vec<(i64, DeadLetterDetails)> {
        self.state.lock().dead_lettered.clone()
    }

    pub fn fail_sends(&self) {
        self.state.lock().fail_sends = true;
    }

    /// Sends never complete.
    pub fn hang_sends(&self) {
        self.state.lock().hang_sends = true;
    }

    pub fn reject_plain(&self) {
        self.state.lock().reject_plain = true;
    }

    pub fn cbs_reply(&self, token_type: &str, reply: CbsReply) {
        self.state
            .lock()
            .cbs_replies
            .insert(token_type.to_string(), reply);
    }

    /// Token types of every put-token request, in order.
    pub fn cbs_requests(&self) -> Vec<String> {
        self.state.lock().cbs_requests.clone()
    }

    pub fn sasl_log(&self) -> Vec<SaslMode> {
        self.state.lock().sasl_log.clone()
    }
}

pub fn messages(range: impl IntoIterator<Item = i64>) -> Vec<MessageDescriptor> {
    range
        .into_iter()
        .map(|n| MessageDescriptor::new(n).with_body(format!("body {n}").into_bytes()))
        .collect()
}

// ── Entity layer ─────────────────────────────────────────────────

#[async_trait]
impl Broker for FakeBus {
    async fn peek(
        &self,
        address: &str,
        from_sequence: i64,
        max: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError> {
        let mut state = self.state.lock();
        Ok(state
            .entity(address)
            .iter()
            .filter(|s| s.message.sequence_number >= from_sequence)
            .take(max as usize)
            .map(|s| s.message.clone())
            .collect())
    }

    async fn open_lock_receiver(
        &self,
        address: &str,
        session_id: Option<&str>,
    ) -> Result<Box<dyn LockReceiver>, TransportError> {
        Ok(Box::new(FakeLockReceiver {
            bus: self.clone(),
            address: address.to_string(),
            session_id: session_id.map(ToString::to_string),
            held: Vec::new(),
        }))
    }

    async fn send(&self, entity_path: &str, message: OutboundMessage) -> Result<(), TransportError> {
        let hang = self.state.lock().hang_sends;
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::Disconnected("send link detached".into()));
        }
        let mut stored = MessageDescriptor::new(0).with_body(message.body.clone());
        stored.body_section = message.body_section.clone();
        stored.session_id = message.session_id.clone();
        stored.message_id = message.message_id.clone();
        stored.application_properties = message.application_properties.clone();
        state.append(entity_path, stored);
        state.sent.push((entity_path.to_string(), message));
        Ok(())
    }
}

pub struct FakeLockReceiver {
    bus: FakeBus,
    address: String,
    session_id: Option<String>,
    held: Vec<i64>,
}

#[async_trait]
impl LockReceiver for FakeLockReceiver {
    async fn receive_batch(
        &mut self,
        max: u32,
        _wait: Duration,
    ) -> Result<Vec<LockedMessage>, TransportError> {
        let mut state = self.bus.state.lock();
        let session = self.session_id.clone();
        let mut batch = Vec::new();
        for stored in state.entity(&self.address).iter_mut() {
            if batch.len() >= max as usize {
                break;
            }
            if stored.locked {
                continue;
            }
            if session.is_some() && stored.message.session_id != session {
                continue;
            }
            stored.locked = true;
            batch.push(LockedMessage {
                lock_id: u64::try_from(stored.message.sequence_number).unwrap_or_default(),
                message: stored.message.clone(),
            });
        }
        self.held
            .extend(batch.iter().map(|l| l.message.sequence_number));
        Ok(batch)
    }

    async fn complete(&mut self, message: &LockedMessage) -> Result<(), TransportError> {
        let sequence = message.message.sequence_number;
        self.bus.state.lock().remove(&self.address, sequence);
        self.held.retain(|s| *s != sequence);
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        message: &LockedMessage,
        details: &DeadLetterDetails,
    ) -> Result<(), TransportError> {
        let sequence = message.message.sequence_number;
        let mut state = self.bus.state.lock();
        if let Some(mut moved) = state.remove(&self.address, sequence) {
            for (key, value) in &details.properties {
                moved
                    .application_properties
                    .insert(key.clone(), value.clone());
            }
            let dlq = format!("{}{DEAD_LETTER_SUFFIX}", self.address);
            state.entity(&dlq).push(Stored {
                message: moved,
                locked: false,
            });
        }
        state.dead_lettered.push((sequence, details.clone()));
        self.held.retain(|s| *s != sequence);
        Ok(())
    }

    async fn abandon(&mut self, message: &LockedMessage) -> Result<(), TransportError> {
        let sequence = message.message.sequence_number;
        let mut state = self.bus.state.lock();
        if let Some(stored) = state
            .entity(&self.address)
            .iter_mut()
            .find(|s| s.message.sequence_number == sequence)
        {
            stored.locked = false;
            stored.message.delivery_count += 1;
        }
        self.held.retain(|s| *s != sequence);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock();
        for sequence in &self.held {
            state.unlock(&self.address, *sequence);
        }
        Ok(())
    }
}

// ── Link layer ───────────────────────────────────────────────────

#[async_trait]
impl Connector for FakeBus {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        sasl: &SaslMode,
    ) -> Result<Box<dyn LinkSession>, TransportError> {
        let mut state = self.state.lock();
        state.sasl_log.push(sasl.clone());
        let authorized = match sasl {
            SaslMode::Plain { .. } if state.reject_plain => {
                return Err(TransportError::Unauthorized("sasl PLAIN rejected".into()));
            }
            SaslMode::Plain { .. } => true,
            SaslMode::Anonymous => false,
        };
        Ok(Box::new(FakeLinkSession {
            bus: self.clone(),
            authorized: Arc::new(AtomicBool::new(authorized)),
        }))
    }
}

pub struct FakeLinkSession {
    bus: FakeBus,
    authorized: Arc<AtomicBool>,
}

#[async_trait]
impl LinkSession for FakeLinkSession {
    async fn open_browse_link(
        &mut self,
        address: &str,
        credit: u32,
    ) -> Result<Box<dyn BrowseLink>, TransportError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(TransportError::Unauthorized(format!(
                "attach to {address} without a token"
            )));
        }
        let mut state = self.bus.state.lock();
        let mut queued = VecDeque::new();
        for stored in state.entity(address).iter_mut() {
            if queued.len() >= credit as usize {
                break;
            }
            if !stored.locked {
                stored.locked = true;
                queued.push_back(stored.message.sequence_number);
            }
        }
        Ok(Box::new(FakeBrowseLink {
            bus: self.bus.clone(),
            address: address.to_string(),
            queued,
            in_flight: Vec::new(),
        }))
    }

    async fn open_cbs_link(&mut self) -> Result<Box<dyn CbsLink>, TransportError> {
        Ok(Box::new(FakeCbsLink {
            bus: self.bus.clone(),
            authorized: self.authorized.clone(),
            replies: VecDeque::new(),
            next_delivery: 0,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct FakeBrowseLink {
    bus: FakeBus,
    address: String,
    queued: VecDeque<i64>,
    in_flight: Vec<i64>,
}

#[async_trait]
impl BrowseLink for FakeBrowseLink {
    async fn recv(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let Some(sequence) = self.queued.pop_front() else {
            tokio::time::sleep(wait).await;
            return Ok(None);
        };
        let message = self
            .bus
            .message(&self.address, sequence)
            .ok_or_else(|| TransportError::Protocol(format!("delivery {sequence} vanished")))?;
        self.in_flight.push(sequence);
        Ok(Some(Delivery {
            id: u64::try_from(sequence).unwrap_or_default(),
            message,
        }))
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let sequence = delivery.message.sequence_number;
        self.bus.state.lock().unlock(&self.address, sequence);
        self.in_flight.retain(|s| *s != sequence);
        Ok(())
    }

    async fn accept(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let sequence = delivery.message.sequence_number;
        self.bus.state.lock().remove(&self.address, sequence);
        self.in_flight.retain(|s| *s != sequence);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock();
        for sequence in self.in_flight.iter().chain(self.queued.iter()) {
            state.unlock(&self.address, *sequence);
        }
        Ok(())
    }
}

pub struct FakeCbsLink {
    bus: FakeBus,
    authorized: Arc<AtomicBool>,
    replies: VecDeque<CbsResponse>,
    next_delivery: u64,
}

#[async_trait]
impl CbsLink for FakeCbsLink {
    async fn set_credit(&mut self, _credit: u32) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_request(&mut self, request: &CbsRequest) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.bus.state.lock();
            state.cbs_requests.push(request.token_type.clone());
            state
                .cbs_replies
                .get(&request.token_type)
                .copied()
                .unwrap_or(CbsReply::Status(200))
        };
        self.next_delivery += 1;
        let (correlation_id, status) = match reply {
            CbsReply::Silent => return Ok(()),
            CbsReply::Status(status) => (request.message_id.clone(), status),
            CbsReply::Mismatched(status) => (format!("other-{}", request.message_id), status),
        };
        if matches!(reply, CbsReply::Status(200 | 202)) {
            self.authorized.store(true, Ordering::SeqCst);
        }
        self.replies.push_back(CbsResponse {
            delivery_id: self.next_delivery,
            correlation_id: Some(correlation_id),
            status_code: Some(status),
            status_description: None,
        });
        Ok(())
    }

    async fn recv_response(
        &mut self,
        wait: Duration,
    ) -> Result<Option<CbsResponse>, TransportError> {
        match self.replies.pop_front() {
            Some(reply) => Ok(Some(reply)),
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn accept(&mut self, _response: &CbsResponse) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

pub fn property(message: &OutboundMessage, key: &str) -> Option<PropertyValue> {
    message.application_properties.get(key).cloned()
}

pub fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, PropertyValue> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), PropertyValue::from(*v)))
        .collect()
}
