//! AMQP 1.0 transport built on `fe2o3-amqp`.
//!
//! [`AmqpConnector`] and [`AmqpLinkSession`] back the raw-browse path and the
//! CBS handshake; [`AmqpBroker`] implements peek, peek-lock and send for the
//! lock-batch path and the pager.

mod broker;
pub mod convert;
mod errors;

pub use broker::{AmqpBroker, BrokerSettings};

use super::traits::{
    BrowseLink, CbsLink, CbsRequest, CbsResponse, Connector, Delivery, Endpoint, LinkSession,
    SaslMode, TransportError,
};
use async_trait::async_trait;
use convert::{message_id_to_string, to_descriptor, AmqpMessage};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery as AmqpDelivery;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{
    ApplicationProperties, Body, Message, MessageId, Properties, Source, Target,
};
use fe2o3_amqp::types::primitives::{OrderedMap, SimpleValue, Timestamp, Value};
use fe2o3_amqp::{Connection, Session};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the claims-based-security node.
pub const CBS_NODE: &str = "$cbs";

pub(crate) fn protocol_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

fn link_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

// ── Connector / session ──────────────────────────────────────────

/// Opens TLS connections to the broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        sasl: &SaslMode,
    ) -> Result<Box<dyn LinkSession>, TransportError> {
        Ok(Box::new(AmqpLinkSession::open(endpoint, sasl).await?))
    }
}

/// One connection plus one session.
pub struct AmqpLinkSession {
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
}

impl AmqpLinkSession {
    pub async fn open(endpoint: &Endpoint, sasl: &SaslMode) -> Result<Self, TransportError> {
        let url = format!("amqps://{}:{}", endpoint.host, endpoint.port);
        let profile = match sasl {
            SaslMode::Plain { username, password } => SaslProfile::Plain {
                username: username.clone(),
                password: password.clone(),
            },
            SaslMode::Anonymous => SaslProfile::Anonymous,
        };

        let mut connection = Connection::builder()
            .container_id(link_name("sbcli"))
            .alt_tls_establishment(true)
            .sasl_profile(profile)
            .open(url.as_str())
            .await
            .map_err(TransportError::from)?;

        let session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err.into());
            }
        };

        Ok(Self {
            connection,
            session,
        })
    }

    pub(crate) fn session_mut(&mut self) -> &mut SessionHandle<()> {
        &mut self.session
    }

    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        let ended = self.session.end().await.map_err(TransportError::from);
        self.connection.close().await.map_err(TransportError::from)?;
        ended
    }
}

#[async_trait]
impl LinkSession for AmqpLinkSession {
    async fn open_browse_link(
        &mut self,
        address: &str,
        credit: u32,
    ) -> Result<Box<dyn BrowseLink>, TransportError> {
        let mut receiver = Receiver::builder()
            .name(link_name("browse"))
            .source(Source::builder().address(address.to_string()).build())
            .target(Target::builder().build())
            .credit_mode(CreditMode::Manual)
            .attach(&mut self.session)
            .await
            .map_err(TransportError::from)?;
        receiver.set_credit(credit).await.map_err(TransportError::from)?;

        Ok(Box::new(AmqpBrowseLink {
            receiver,
            next_id: 0,
            pending: HashMap::new(),
        }))
    }

    async fn open_cbs_link(&mut self) -> Result<Box<dyn CbsLink>, TransportError> {
        let reply_to = link_name("cbs-reply");
        let sender = Sender::attach(&mut self.session, link_name("cbs-sender"), CBS_NODE)
            .await
            .map_err(TransportError::from)?;
        let receiver = Receiver::builder()
            .name(link_name("cbs-receiver"))
            .source(Source::builder().address(CBS_NODE).build())
            .target(Target::builder().address(reply_to.clone()).build())
            .credit_mode(CreditMode::Manual)
            .attach(&mut self.session)
            .await
            .map_err(TransportError::from)?;

        Ok(Box::new(AmqpCbsLink {
            sender,
            receiver,
            reply_to,
            next_id: 0,
            pending: HashMap::new(),
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        (*self).shutdown().await
    }
}

// ── Browse link ──────────────────────────────────────────────────

struct AmqpBrowseLink {
    receiver: Receiver,
    next_id: u64,
    pending: HashMap<u64, AmqpDelivery<Body<Value>>>,
}

impl AmqpBrowseLink {
    fn take(&mut self, delivery: &Delivery) -> Result<AmqpDelivery<Body<Value>>, TransportError> {
        self.pending
            .remove(&delivery.id)
            .ok_or_else(|| TransportError::Protocol(format!("unknown delivery {}", delivery.id)))
    }
}

#[async_trait]
impl BrowseLink for AmqpBrowseLink {
    async fn recv(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let Ok(received) = tokio::time::timeout(wait, self.receiver.recv::<Body<Value>>()).await
        else {
            return Ok(None);
        };
        let delivery = received.map_err(TransportError::from)?;

        let id = self.next_id;
        self.next_id += 1;
        let message = to_descriptor(delivery.message());
        self.pending.insert(id, delivery);
        Ok(Some(Delivery { id, message }))
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let raw = self.take(delivery)?;
        self.receiver.release(&raw).await.map_err(TransportError::from)
    }

    async fn accept(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let raw = self.take(delivery)?;
        self.receiver.accept(&raw).await.map_err(TransportError::from)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let this = *self;
        this.receiver.close().await.map_err(TransportError::from)
    }
}

// ── CBS link ─────────────────────────────────────────────────────

struct AmqpCbsLink {
    sender: Sender,
    receiver: Receiver,
    reply_to: String,
    next_id: u64,
    pending: HashMap<u64, AmqpDelivery<Body<Value>>>,
}

fn int_property(props: &ApplicationProperties, key: &str) -> Option<i32> {
    props.0.iter().find_map(|(k, v)| {
        if k != key {
            return None;
        }
        match v {
            SimpleValue::Int(n) => Some(*n),
            SimpleValue::Long(n) => i32::try_from(*n).ok(),
            SimpleValue::Uint(n) => i32::try_from(*n).ok(),
            SimpleValue::String(s) => s.parse().ok(),
            _ => None,
        }
    })
}

fn string_property(props: &ApplicationProperties, key: &str) -> Option<String> {
    props.0.iter().find_map(|(k, v)| match v {
        SimpleValue::String(s) if k == key => Some(s.clone()),
        _ => None,
    })
}

fn cbs_response(id: u64, message: &AmqpMessage) -> CbsResponse {
    let correlation_id = message
        .properties
        .as_ref()
        .and_then(|p| p.correlation_id.as_ref())
        .map(message_id_to_string);
    let app = message.application_properties.as_ref();
    CbsResponse {
        delivery_id: id,
        correlation_id,
        status_code: app.and_then(|p| {
            int_property(p, "status-code").or_else(|| int_property(p, "statusCode"))
        }),
        status_description: app.and_then(|p| {
            string_property(p, "status-description")
                .or_else(|| string_property(p, "statusDescription"))
        }),
    }
}

/// `put-token` request properties; `expiration` is an AMQP timestamp.
fn put_token_properties(request: &CbsRequest) -> ApplicationProperties {
    let mut app = OrderedMap::new();
    app.insert("operation".to_string(), SimpleValue::String("put-token".into()));
    app.insert(
        "type".to_string(),
        SimpleValue::String(request.token_type.clone()),
    );
    app.insert("name".to_string(), SimpleValue::String(request.audience.clone()));
    app.insert(
        "expiration".to_string(),
        SimpleValue::Timestamp(Timestamp::from_milliseconds(
            request.expiration.saturating_mul(1000),
        )),
    );
    ApplicationProperties(app)
}

#[async_trait]
impl CbsLink for AmqpCbsLink {
    async fn set_credit(&mut self, credit: u32) -> Result<(), TransportError> {
        self.receiver.set_credit(credit).await.map_err(TransportError::from)
    }

    async fn send_request(&mut self, request: &CbsRequest) -> Result<(), TransportError> {
        let message = Message::builder()
            .properties(Properties {
                message_id: Some(MessageId::String(request.message_id.clone())),
                reply_to: Some(self.reply_to.clone()),
                ..Properties::default()
            })
            .application_properties(put_token_properties(request))
            .value(request.token.clone())
            .build();

        self.sender.send(message).await.map_err(TransportError::from)?;
        Ok(())
    }

    async fn recv_response(&mut self, wait: Duration) -> Result<Option<CbsResponse>, TransportError> {
        let Ok(received) = tokio::time::timeout(wait, self.receiver.recv::<Body<Value>>()).await
        else {
            return Ok(None);
        };
        let delivery = received.map_err(TransportError::from)?;

        let id = self.next_id;
        self.next_id += 1;
        let response = cbs_response(id, delivery.message());
        self.pending.insert(id, delivery);
        Ok(Some(response))
    }

    async fn accept(&mut self, response: &CbsResponse) -> Result<(), TransportError> {
        let raw = self.pending.remove(&response.delivery_id).ok_or_else(|| {
            TransportError::Protocol(format!("unknown delivery {}", response.delivery_id))
        })?;
        self.receiver.accept(&raw).await.map_err(TransportError::from)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let this = *self;
        let sender = this.sender.close().await.map_err(TransportError::from);
        this.receiver.close().await.map_err(TransportError::from)?;
        sender
    }
}
