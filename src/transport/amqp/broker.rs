use super::convert::{property_to_value, to_amqp_parts, to_descriptor, wire_body, AmqpMessage};
use super::{link_name, protocol_error, AmqpLinkSession};
use crate::auth::{self, cbs, AuthError, Credential, SharedKey, SAS_TOKEN_TYPE, SERVICE_BUS_SCOPE};
use crate::model::{MessageDescriptor, OutboundMessage};
use crate::transport::connection::retry_until_deadline;
use crate::transport::{
    bounded, Broker, DeadLetterDetails, Endpoint, LockReceiver, LockedMessage, SaslMode,
    TransportError,
};
use async_trait::async_trait;
use fe2o3_amqp::link::delivery::Delivery as AmqpDelivery;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::definitions::{self, ErrorCondition, Fields};
use fe2o3_amqp::types::messaging::message::__private::Deserializable;
use fe2o3_amqp::types::messaging::{
    AmqpValue, ApplicationProperties, Body, Message, MessageId, Modified, Outcome, Properties,
    Source, Target,
};
use fe2o3_amqp::types::primitives::{OrderedMap, SimpleValue, Symbol, Value};
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

const PEEK_OPERATION: &str = "com.microsoft:peek-message";
const SESSION_FILTER: &str = "com.microsoft:session-filter";
const DEAD_LETTER_CONDITION: &str = "com.microsoft:dead-letter";
/// After the first message of a batch arrives, stragglers get this long.
const BATCH_STRAGGLER_WAIT: Duration = Duration::from_millis(250);
/// Deliveries already in flight when credit is withdrawn arrive within this.
const CREDIT_SETTLE_WAIT: Duration = Duration::from_millis(50);

/// Connection-level settings for [`AmqpBroker`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub endpoint: Endpoint,
    pub cbs_audience_scheme: String,
    pub sas_audience_scheme: String,
    pub token_types: Vec<String>,
    /// Authorize shared keys with a signed SAS token over CBS instead of SASL `PLAIN`.
    pub shared_key_cbs: bool,
    pub connect_timeout: Duration,
    pub cbs_response_timeout: Duration,
    pub operation_timeout: Duration,
}

/// How entity access is obtained on the current connection.
enum Authorization {
    /// SASL `PLAIN` already grants access.
    Sasl,
    /// Every entity needs a put-token first.
    Federated,
    SasOverCbs(SharedKey),
}

struct Connected {
    link: AmqpLinkSession,
    authorization: Authorization,
    authorized: HashSet<String>,
}

struct AttachState<L> {
    receivers: usize,
    parked: Vec<L>,
}

/// Counts attached lock receivers. A connection retired while any are
/// attached is parked and closed once the last one detaches.
struct Attachments<L> {
    state: parking_lot::Mutex<AttachState<L>>,
    close: fn(L),
}

impl<L> Attachments<L> {
    fn new(close: fn(L)) -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(AttachState {
                receivers: 0,
                parked: Vec::new(),
            }),
            close,
        })
    }

    fn attach(self: &Arc<Self>) -> Attached<L> {
        self.state.lock().receivers += 1;
        Attached(Arc::clone(self))
    }

    /// Close `link` now, or park it until no receiver is attached.
    fn retire(&self, link: L) {
        let mut state = self.state.lock();
        if state.receivers > 0 {
            state.parked.push(link);
            return;
        }
        drop(state);
        (self.close)(link);
    }

    fn take_parked(&self) -> Vec<L> {
        std::mem::take(&mut self.state.lock().parked)
    }
}

/// Held by an attached receiver.
struct Attached<L>(Arc<Attachments<L>>);

impl<L> Drop for Attached<L> {
    fn drop(&mut self) {
        let released = {
            let mut state = self.0.state.lock();
            state.receivers = state.receivers.saturating_sub(1);
            if state.receivers == 0 {
                std::mem::take(&mut state.parked)
            } else {
                Vec::new()
            }
        };
        for link in released {
            (self.0.close)(link);
        }
    }
}

fn close_in_background(link: AmqpLinkSession) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        if let Err(err) = link.shutdown().await {
            tracing::debug!("background connection close failed: {err}");
        }
    });
}

/// Broker operations over a single lazily opened AMQP connection.
pub struct AmqpBroker {
    settings: BrokerSettings,
    credential: Credential,
    cancel: CancellationToken,
    state: Mutex<Option<Connected>>,
    attachments: Arc<Attachments<AmqpLinkSession>>,
}

impl AmqpBroker {
    pub fn new(settings: BrokerSettings, credential: Credential, cancel: CancellationToken) -> Self {
        Self {
            settings,
            credential,
            cancel,
            state: Mutex::new(None),
            attachments: Attachments::new(close_in_background),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Close the shared connection and any parked ones.
    pub async fn shutdown(&self) {
        let current = self.state.lock().await.take().map(|c| c.link);
        for link in current.into_iter().chain(self.attachments.take_parked()) {
            if let Err(err) = link.shutdown().await {
                tracing::debug!("closing broker connection failed: {err}");
            }
        }
    }

    async fn open(&self, sasl: &SaslMode) -> Result<AmqpLinkSession, TransportError> {
        let endpoint = &self.settings.endpoint;
        retry_until_deadline("AMQP connect", self.settings.connect_timeout, &self.cancel, || {
            AmqpLinkSession::open(endpoint, sasl)
        })
        .await
    }

    async fn connect(&self) -> Result<Connected, AuthError> {
        let (sasl, authorization) = match &self.credential {
            Credential::SharedKey(key) if self.settings.shared_key_cbs => {
                (SaslMode::Anonymous, Authorization::SasOverCbs(key.clone()))
            }
            Credential::SharedKey(key) => (key.sasl(), Authorization::Sasl),
            Credential::Federated { .. } => (SaslMode::Anonymous, Authorization::Federated),
        };
        let link = self.open(&sasl).await?;
        Ok(Connected {
            link,
            authorization,
            authorized: HashSet::new(),
        })
    }

    async fn put_token(&self, connected: &mut Connected, path: &str) -> Result<(), AuthError> {
        let host = &self.settings.endpoint.host;
        let (audience, token, token_types) = match &connected.authorization {
            Authorization::Sasl => return Ok(()),
            Authorization::Federated => {
                let Credential::Federated { provider, .. } = &self.credential else {
                    return Err(AuthError::Unauthorized("federated credential missing".into()));
                };
                let token = provider.get_token(&[SERVICE_BUS_SCOPE]).await?;
                (
                    auth::audience(&self.settings.cbs_audience_scheme, host, path),
                    token.token,
                    self.settings.token_types.clone(),
                )
            }
            Authorization::SasOverCbs(key) => {
                let audience = auth::audience(&self.settings.sas_audience_scheme, host, path);
                let token = key.sas_token(&audience, cbs::TOKEN_LIFETIME)?;
                (audience, token, vec![SAS_TOKEN_TYPE.to_string()])
            }
        };

        cbs::put_token(
            &mut connected.link,
            &audience,
            &token,
            &token_types,
            self.settings.cbs_response_timeout,
            &self.cancel,
        )
        .await
    }

    /// Lock the shared connection, opening it and authorizing `path` as needed.
    async fn session_for(
        &self,
        path: &str,
    ) -> Result<MutexGuard<'_, Option<Connected>>, TransportError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await.map_err(into_transport)?);
        }

        let needs_token = guard
            .as_ref()
            .is_some_and(|c| !matches!(c.authorization, Authorization::Sasl) && !c.authorized.contains(path));
        if !needs_token {
            return Ok(guard);
        }

        let Some(connected) = guard.as_mut() else {
            return Err(TransportError::Disconnected("connection not available".into()));
        };
        match self.put_token(connected, path).await {
            Ok(()) => {
                connected.authorized.insert(path.to_string());
                Ok(guard)
            }
            Err(err) => {
                let fallback = match &self.credential {
                    Credential::Federated {
                        fallback: Some(key),
                        ..
                    } => Some(key.clone()),
                    _ => None,
                };
                let Some(key) = fallback else {
                    return Err(into_transport(err));
                };
                tracing::warn!(path, "federated authorization failed ({err}); retrying with shared key");
                if let Some(old) = guard.take() {
                    self.attachments.retire(old.link);
                }
                let link = self.open(&key.sasl()).await?;
                *guard = Some(Connected {
                    link,
                    authorization: Authorization::Sasl,
                    authorized: HashSet::new(),
                });
                Ok(guard)
            }
        }
    }

    async fn reset_on_failure(&self, err: &TransportError) {
        if !matches!(err, TransportError::Disconnected(_)) {
            return;
        }
        if let Some(old) = self.state.lock().await.take() {
            self.attachments.retire(old.link);
        }
    }

    async fn management_peek(
        &self,
        address: &str,
        from_sequence: i64,
        max: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError> {
        let mut guard = self.session_for(address).await?;
        let connected = guard
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("connection not available".into()))?;
        bounded(
            "management peek",
            self.settings.operation_timeout,
            &self.cancel,
            peek_on(connected.link.session_mut(), address, from_sequence, max),
        )
        .await
    }
}

async fn peek_on(
    session: &mut SessionHandle<()>,
    address: &str,
    from_sequence: i64,
    max: u32,
) -> Result<Vec<MessageDescriptor>, TransportError> {
    let node = format!("{address}/$management");
    let reply_to = link_name("mgmt-reply");
    let mut sender = Sender::attach(session, link_name("mgmt-sender"), node.as_str()).await?;
    let mut receiver = Receiver::builder()
        .name(link_name("mgmt-receiver"))
        .source(Source::builder().address(node.clone()).build())
        .target(Target::builder().address(reply_to.clone()).build())
        .credit_mode(CreditMode::Manual)
        .attach(session)
        .await?;

    let result = async {
        receiver.set_credit(1).await?;
        sender.send(peek_request(&reply_to, from_sequence, max)).await?;
        let delivery = receiver.recv::<Body<Value>>().await?;
        let _ = receiver.accept(&delivery).await;
        parse_peek_response(delivery.message())
    }
    .await;

    let _ = sender.close().await;
    let _ = receiver.close().await;
    result
}

fn peek_request(reply_to: &str, from_sequence: i64, max: u32) -> AmqpMessage {
    let mut body = OrderedMap::new();
    body.insert(
        Value::String("from-sequence-number".into()),
        Value::Long(from_sequence),
    );
    body.insert(
        Value::String("message-count".into()),
        Value::Int(i32::try_from(max).unwrap_or(i32::MAX)),
    );
    let mut app = OrderedMap::new();
    app.insert(
        "operation".to_string(),
        SimpleValue::String(PEEK_OPERATION.into()),
    );
    Message::builder()
        .properties(Properties {
            message_id: Some(MessageId::String(uuid::Uuid::new_v4().to_string())),
            reply_to: Some(reply_to.to_string()),
            ..Properties::default()
        })
        .application_properties(ApplicationProperties(app))
        .body(Body::Value(AmqpValue(Value::Map(body))))
        .build()
}

/// Source for a peek-lock receiver, scoped to one session when given.
fn lock_source(address: &str, session_id: Option<&str>) -> Source {
    let mut source = Source::builder().address(address.to_string());
    if let Some(session_id) = session_id {
        source = source.add_to_filter(
            Symbol::from(SESSION_FILTER),
            Described {
                descriptor: Descriptor::Name(Symbol::from(SESSION_FILTER)),
                value: Value::String(session_id.to_string()),
            },
        );
    }
    source.build()
}

async fn send_on(
    session: &mut SessionHandle<()>,
    entity_path: &str,
    wire: AmqpMessage,
) -> Result<(), TransportError> {
    let mut sender = Sender::attach(session, link_name("send"), entity_path).await?;
    let outcome = sender.send(wire).await;
    let _ = sender.close().await;

    match outcome? {
        Outcome::Accepted(_) => Ok(()),
        other => Err(TransportError::Protocol(format!(
            "send was not accepted: {other:?}"
        ))),
    }
}

/// `reject` error carrying the dead-letter reason and description.
fn dead_letter_error(details: &DeadLetterDetails) -> definitions::Error {
    let mut info: Fields = OrderedMap::new();
    info.insert(
        Symbol::from("DeadLetterReason"),
        Value::String(details.reason.clone()),
    );
    info.insert(
        Symbol::from("DeadLetterErrorDescription"),
        Value::String(details.description.clone()),
    );
    for (key, value) in &details.properties {
        info.insert(Symbol::from(key.as_str()), property_to_value(value));
    }
    definitions::Error {
        condition: ErrorCondition::Custom(Symbol::from(DEAD_LETTER_CONDITION)),
        description: Some(details.description.clone()),
        info: Some(info),
    }
}

fn into_transport(err: AuthError) -> TransportError {
    match err {
        AuthError::Transport(inner) => inner,
        other if other.is_unauthorized() => TransportError::Unauthorized(other.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

fn map_lookup<'a>(map: &'a OrderedMap<Value, Value>, key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::String(s) | Value::Symbol(Symbol(s)) if s == key => Some(v),
        _ => None,
    })
}

fn status_code(message: &AmqpMessage) -> Option<i32> {
    message
        .application_properties
        .as_ref()?
        .0
        .iter()
        .find_map(|(k, v)| match v {
            SimpleValue::Int(n) if k == "statusCode" || k == "status-code" => Some(*n),
            _ => None,
        })
}

fn parse_peek_response(message: &AmqpMessage) -> Result<Vec<MessageDescriptor>, TransportError> {
    match status_code(message) {
        Some(200) => {}
        Some(204) => return Ok(Vec::new()),
        Some(status @ (401 | 403)) => {
            return Err(TransportError::Unauthorized(format!(
                "peek returned status {status}"
            )))
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "peek returned status {other:?}"
            )))
        }
    }

    let Body::Value(value) = &message.body else {
        return Err(protocol_error("peek response has no value body"));
    };
    let Value::Map(map) = &value.0 else {
        return Err(protocol_error("peek response body is not a map"));
    };
    let Some(Value::List(items)) = map_lookup(map, "messages") else {
        return Ok(Vec::new());
    };

    let mut peeked = Vec::with_capacity(items.len());
    for item in items {
        let Value::Map(entry) = item else { continue };
        let Some(Value::Binary(bytes)) = map_lookup(entry, "message") else {
            continue;
        };
        let decoded: Deserializable<AmqpMessage> =
            serde_amqp::from_slice(bytes).map_err(protocol_error)?;
        peeked.push(to_descriptor(&decoded.0));
    }
    Ok(peeked)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn peek(
        &self,
        address: &str,
        from_sequence: i64,
        max: u32,
    ) -> Result<Vec<MessageDescriptor>, TransportError> {
        let result = self.management_peek(address, from_sequence, max).await;
        if let Err(err) = &result {
            self.reset_on_failure(err).await;
        }
        result
    }

    async fn open_lock_receiver(
        &self,
        address: &str,
        session_id: Option<&str>,
    ) -> Result<Box<dyn LockReceiver>, TransportError> {
        let mut guard = self.session_for(address).await?;
        let connected = guard
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("connection not available".into()))?;

        let attach = Receiver::builder()
            .name(link_name("lock"))
            .source(lock_source(address, session_id))
            .target(Target::builder().build())
            .credit_mode(CreditMode::Manual)
            .attach(connected.link.session_mut());
        let attached = bounded(
            "lock receiver attach",
            self.settings.operation_timeout,
            &self.cancel,
            async { attach.await.map_err(TransportError::from) },
        )
        .await;
        drop(guard);

        let receiver = match attached {
            Ok(receiver) => receiver,
            Err(err) => {
                self.reset_on_failure(&err).await;
                return Err(err);
            }
        };
        Ok(Box::new(AmqpLockReceiver {
            receiver,
            next_id: 0,
            pending: HashMap::new(),
            _attached: self.attachments.attach(),
        }))
    }

    async fn send(&self, entity_path: &str, message: OutboundMessage) -> Result<(), TransportError> {
        let (header, annotations, properties, app) = to_amqp_parts(&message);
        let mut wire = Message::builder()
            .properties(properties)
            .application_properties(app)
            .body(wire_body(&message)?)
            .build();
        wire.header = header;
        wire.message_annotations = annotations;

        let mut guard = self.session_for(entity_path).await?;
        let connected = guard
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("connection not available".into()))?;
        let result = bounded(
            "send",
            self.settings.operation_timeout,
            &self.cancel,
            send_on(connected.link.session_mut(), entity_path, wire),
        )
        .await;
        drop(guard);

        if let Err(err) = &result {
            self.reset_on_failure(err).await;
        }
        result
    }
}

// ── Lock receiver ────────────────────────────────────────────────

#[async_trait]
trait DeliverySource: Send {
    type Item: Send;

    async fn next_delivery(&mut self) -> Result<Self::Item, TransportError>;
}

#[async_trait]
impl DeliverySource for Receiver {
    type Item = AmqpDelivery<Body<Value>>;

    async fn next_delivery(&mut self) -> Result<Self::Item, TransportError> {
        Ok(self.recv::<Body<Value>>().await?)
    }
}

/// Up to `max` deliveries: `wait` for the first, [`BATCH_STRAGGLER_WAIT`]
/// for each one after. A failure once deliveries are in hand ends the batch
/// early; those deliveries are locked and still need settling.
async fn collect_batch<S: DeliverySource + ?Sized>(
    source: &mut S,
    max: usize,
    wait: Duration,
) -> Result<Vec<S::Item>, TransportError> {
    let mut batch = Vec::new();
    let mut budget = wait;
    while batch.len() < max {
        let Ok(received) = tokio::time::timeout(budget, source.next_delivery()).await else {
            break;
        };
        match received {
            Ok(delivery) => batch.push(delivery),
            Err(err) if batch.is_empty() => return Err(err),
            Err(err) => {
                tracing::warn!(received = batch.len(), "receive failed mid-batch: {err}");
                break;
            }
        }
        budget = BATCH_STRAGGLER_WAIT;
    }
    Ok(batch)
}

struct AmqpLockReceiver {
    receiver: Receiver,
    next_id: u64,
    pending: HashMap<u64, AmqpDelivery<Body<Value>>>,
    _attached: Attached<AmqpLinkSession>,
}

impl AmqpLockReceiver {
    fn take(&mut self, message: &LockedMessage) -> Result<AmqpDelivery<Body<Value>>, TransportError> {
        self.pending.remove(&message.lock_id).ok_or_else(|| {
            TransportError::Protocol(format!("message {} is not locked", message.lock_id))
        })
    }

    /// Withdraw unused credit and release whatever was already in flight.
    async fn withdraw_credit(&mut self) {
        if let Err(err) = self.receiver.set_credit(0).await {
            tracing::debug!("withdrawing receive credit failed: {err}");
            return;
        }
        while let Ok(Ok(delivery)) =
            tokio::time::timeout(CREDIT_SETTLE_WAIT, self.receiver.recv::<Body<Value>>()).await
        {
            if let Err(err) = self.receiver.release(&delivery).await {
                tracing::debug!("releasing surplus delivery failed: {err}");
            }
        }
    }
}

#[async_trait]
impl LockReceiver for AmqpLockReceiver {
    async fn receive_batch(
        &mut self,
        max: u32,
        wait: Duration,
    ) -> Result<Vec<LockedMessage>, TransportError> {
        let max = max.max(1);
        self.receiver.set_credit(max).await?;

        let deliveries = collect_batch(&mut self.receiver, max as usize, wait).await?;
        if deliveries.len() < max as usize {
            self.withdraw_credit().await;
        }

        let mut batch = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let id = self.next_id;
            self.next_id += 1;
            batch.push(LockedMessage {
                lock_id: id,
                message: to_descriptor(delivery.message()),
            });
            self.pending.insert(id, delivery);
        }
        Ok(batch)
    }

    async fn complete(&mut self, message: &LockedMessage) -> Result<(), TransportError> {
        let raw = self.take(message)?;
        self.receiver.accept(&raw).await.map_err(TransportError::from)
    }

    async fn dead_letter(
        &mut self,
        message: &LockedMessage,
        details: &DeadLetterDetails,
    ) -> Result<(), TransportError> {
        let raw = self.take(message)?;
        self.receiver
            .reject(&raw, dead_letter_error(details))
            .await
            .map_err(TransportError::from)
    }

    async fn abandon(&mut self, message: &LockedMessage) -> Result<(), TransportError> {
        let raw = self.take(message)?;
        let modified = Modified {
            delivery_failed: Some(true),
            undeliverable_here: None,
            message_annotations: None,
        };
        self.receiver.modify(&raw, modified).await.map_err(TransportError::from)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let this = *self;
        this.receiver.close().await.map_err(TransportError::from)
    }
}
