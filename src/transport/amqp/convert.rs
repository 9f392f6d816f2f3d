//! Mapping between `fe2o3-amqp` messages and the crate's model types.

use crate::model::{
    sequence_from_annotation, AnnotationValue, BodySection, MessageDescriptor, OutboundMessage,
    PropertyValue, ENQUEUED_TIME_ANNOTATION, PARTITION_KEY_ANNOTATION, SEQUENCE_NUMBER_ANNOTATION,
};
use crate::transport::TransportError;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use fe2o3_amqp::types::messaging::annotations::OwnedKey;
use fe2o3_amqp::types::messaging::{
    AmqpSequence, AmqpValue, ApplicationProperties, Batch, Body, Data, Header, Message,
    MessageAnnotations, MessageId, Properties,
};
use fe2o3_amqp::types::primitives::{Binary, OrderedMap, SimpleValue, Symbol, Timestamp, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub type AmqpMessage = Message<Body<Value>>;

pub fn message_id_to_string(id: &MessageId) -> String {
    match id {
        MessageId::String(s) => s.clone(),
        MessageId::Ulong(n) => n.to_string(),
        MessageId::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => format!("{other:?}"),
    }
}

fn timestamp_to_utc(ts: &Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts.milliseconds()).single()
}

fn annotation(message: &AmqpMessage, key: &str) -> Option<Value> {
    let annotations = message.message_annotations.as_ref()?;
    annotations.0.iter().find_map(|(k, v)| match k {
        OwnedKey::Symbol(symbol) if symbol.0 == key => Some(v.clone()),
        _ => None,
    })
}

pub fn annotation_value(value: &Value) -> AnnotationValue {
    match value {
        Value::Long(v) => AnnotationValue::Long(*v),
        Value::Int(v) => AnnotationValue::Int(*v),
        Value::Ulong(v) => AnnotationValue::ULong(*v),
        Value::Uint(v) => AnnotationValue::UInt(*v),
        Value::Double(v) => AnnotationValue::Decimal(v.0),
        Value::Float(v) => AnnotationValue::Decimal(f64::from(v.0)),
        Value::String(v) => AnnotationValue::String(v.clone()),
        Value::Symbol(v) => AnnotationValue::String(v.0.clone()),
        _ => AnnotationValue::Other,
    }
}

/// Sequence number from the message annotations, if present and parseable.
pub fn sequence_number(message: &AmqpMessage) -> Option<i64> {
    annotation(message, SEQUENCE_NUMBER_ANNOTATION)
        .as_ref()
        .map(annotation_value)
        .and_then(|v| sequence_from_annotation(&v))
}

/// Session id travels in the AMQP `group-id` property.
pub fn session_id(message: &AmqpMessage) -> Option<String> {
    message.properties.as_ref()?.group_id.clone()
}

/// Display form of a non-string value body.
fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Bool(v) => Json::from(*v),
        Value::Ubyte(v) => Json::from(*v),
        Value::Ushort(v) => Json::from(*v),
        Value::Uint(v) => Json::from(*v),
        Value::Ulong(v) => Json::from(*v),
        Value::Byte(v) => Json::from(*v),
        Value::Short(v) => Json::from(*v),
        Value::Int(v) => Json::from(*v),
        Value::Long(v) => Json::from(*v),
        Value::Float(v) => Json::from(f64::from(v.0)),
        Value::Double(v) => Json::from(v.0),
        Value::Char(v) => Json::from(v.to_string()),
        Value::Timestamp(ts) => timestamp_to_utc(ts)
            .map_or_else(|| Json::from(ts.milliseconds()), |t| Json::from(t.to_rfc3339())),
        Value::String(v) => Json::from(v.as_str()),
        Value::Symbol(v) => Json::from(v.0.as_str()),
        Value::Binary(v) => {
            Json::from(base64::engine::general_purpose::STANDARD.encode(v.as_slice()))
        }
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Array(items) => Json::Array(items.0.iter().map(value_to_json).collect()),
        Value::Map(map) => Json::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::String(s) => s.clone(),
                        Value::Symbol(s) => s.0.clone(),
                        other => value_to_json(other).to_string(),
                    };
                    (key, value_to_json(v))
                })
                .collect(),
        ),
        Value::Described(described) => value_to_json(&described.value),
        other => Json::from(format!("{other:?}")),
    }
}

/// Display bytes plus the section needed to resend the body unchanged.
fn capture_body(body: &Body<Value>) -> (Vec<u8>, BodySection) {
    match body {
        Body::Data(batch) => (
            batch.iter().flat_map(|data| data.0.iter().copied()).collect(),
            BodySection::Data,
        ),
        Body::Value(value) => {
            let display = match &value.0 {
                Value::String(s) => s.clone().into_bytes(),
                Value::Binary(b) => b.to_vec(),
                Value::Null => Vec::new(),
                other => value_to_json(other).to_string().into_bytes(),
            };
            let section = serde_amqp::to_vec(&value.0)
                .map_or_else(|_| BodySection::Opaque("amqp-value".into()), BodySection::Value);
            (display, section)
        }
        Body::Sequence(batch) => {
            let display = serde_json::Value::Array(
                batch
                    .iter()
                    .map(|seq| serde_json::Value::Array(seq.0.iter().map(value_to_json).collect()))
                    .collect(),
            );
            let encoded: Result<Vec<_>, _> = batch
                .iter()
                .map(|seq| serde_amqp::to_vec(&Value::List(seq.0.clone())))
                .collect();
            let section = encoded
                .map_or_else(|_| BodySection::Opaque("amqp-sequence".into()), BodySection::Sequence);
            (display.to_string().into_bytes(), section)
        }
        Body::Empty => (Vec::new(), BodySection::Data),
    }
}

/// Body for a send, rebuilt in the section the message arrived with.
pub fn wire_body(message: &OutboundMessage) -> Result<Body<Value>, TransportError> {
    let decode = |raw: &[u8]| -> Result<Value, TransportError> {
        serde_amqp::from_slice(raw).map_err(|e| TransportError::Protocol(e.to_string()))
    };
    match &message.body_section {
        BodySection::Data => Ok(Body::Data(Batch::new(vec![Data(Binary::from(
            message.body.clone(),
        ))]))),
        BodySection::Value(raw) => Ok(Body::Value(AmqpValue(decode(raw)?))),
        BodySection::Sequence(sections) => {
            let mut batch = Vec::with_capacity(sections.len());
            for raw in sections {
                match decode(raw)? {
                    Value::List(items) => batch.push(AmqpSequence(items)),
                    other => {
                        return Err(TransportError::Protocol(format!(
                            "sequence section decoded as {other:?}"
                        )))
                    }
                }
            }
            Ok(Body::Sequence(Batch::new(batch)))
        }
        BodySection::Opaque(kind) => Err(TransportError::Protocol(format!(
            "{kind} body cannot be resent unchanged"
        ))),
    }
}

fn simple_to_property(value: &SimpleValue) -> PropertyValue {
    match value {
        SimpleValue::Null => PropertyValue::Null,
        SimpleValue::Bool(v) => PropertyValue::Bool(*v),
        SimpleValue::Byte(v) => PropertyValue::Int(i32::from(*v)),
        SimpleValue::Short(v) => PropertyValue::Int(i32::from(*v)),
        SimpleValue::Int(v) => PropertyValue::Int(*v),
        SimpleValue::Long(v) => PropertyValue::Long(*v),
        SimpleValue::Ubyte(v) => PropertyValue::Int(i32::from(*v)),
        SimpleValue::Ushort(v) => PropertyValue::Int(i32::from(*v)),
        SimpleValue::Uint(v) => PropertyValue::Long(i64::from(*v)),
        SimpleValue::Ulong(v) => i64::try_from(*v)
            .map(PropertyValue::Long)
            .unwrap_or_else(|_| PropertyValue::String(v.to_string())),
        SimpleValue::Float(v) => PropertyValue::Double(f64::from(v.0)),
        SimpleValue::Double(v) => PropertyValue::Double(v.0),
        SimpleValue::String(v) => PropertyValue::String(v.clone()),
        SimpleValue::Symbol(v) => PropertyValue::String(v.0.clone()),
        SimpleValue::Binary(v) => PropertyValue::Binary(v.clone().into_vec()),
        SimpleValue::Timestamp(v) => timestamp_to_utc(v)
            .map_or(PropertyValue::Long(v.milliseconds()), PropertyValue::Timestamp),
        other => PropertyValue::String(format!("{other:?}")),
    }
}

fn property_to_simple(value: &PropertyValue) -> SimpleValue {
    match value {
        PropertyValue::Null => SimpleValue::Null,
        PropertyValue::Bool(v) => SimpleValue::Bool(*v),
        PropertyValue::Int(v) => SimpleValue::Int(*v),
        PropertyValue::Long(v) => SimpleValue::Long(*v),
        PropertyValue::Double(v) => SimpleValue::from(*v),
        PropertyValue::String(v) => SimpleValue::String(v.clone()),
        PropertyValue::Timestamp(v) => {
            SimpleValue::Timestamp(Timestamp::from_milliseconds(v.timestamp_millis()))
        }
        PropertyValue::Binary(v) => SimpleValue::Binary(Binary::from(v.clone())),
    }
}

/// Value form used inside error `info` fields.
pub fn property_to_value(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Null => Value::Null,
        PropertyValue::Bool(v) => Value::Bool(*v),
        PropertyValue::Int(v) => Value::Int(*v),
        PropertyValue::Long(v) => Value::Long(*v),
        PropertyValue::Double(v) => Value::from(*v),
        PropertyValue::String(v) => Value::String(v.clone()),
        PropertyValue::Timestamp(v) => {
            Value::Timestamp(Timestamp::from_milliseconds(v.timestamp_millis()))
        }
        PropertyValue::Binary(v) => Value::Binary(Binary::from(v.clone())),
    }
}

/// Build a descriptor from a received or peeked message.
pub fn to_descriptor(message: &AmqpMessage) -> MessageDescriptor {
    let mut descriptor = MessageDescriptor::new(sequence_number(message).unwrap_or(-1));

    if let Some(props) = &message.properties {
        descriptor.message_id = props.message_id.as_ref().map(message_id_to_string);
        descriptor.correlation_id = props.correlation_id.as_ref().map(message_id_to_string);
        descriptor.subject.clone_from(&props.subject);
        descriptor.reply_to.clone_from(&props.reply_to);
        descriptor.reply_to_session_id.clone_from(&props.reply_to_group_id);
        descriptor.session_id.clone_from(&props.group_id);
        descriptor.content_type = props.content_type.as_ref().map(|s| s.0.clone());
        descriptor.expires_at = props.absolute_expiry_time.as_ref().and_then(timestamp_to_utc);
    }

    if let Some(header) = &message.header {
        descriptor.delivery_count = header.delivery_count;
        descriptor.time_to_live = header.ttl.map(|ms| Duration::from_millis(u64::from(ms)));
    }

    descriptor.enqueued_time = match annotation(message, ENQUEUED_TIME_ANNOTATION) {
        Some(Value::Timestamp(ts)) => timestamp_to_utc(&ts),
        _ => None,
    };
    descriptor.partition_key = match annotation(message, PARTITION_KEY_ANNOTATION) {
        Some(Value::String(key)) => Some(key),
        _ => None,
    };

    if let Some(app) = &message.application_properties {
        descriptor.application_properties = app
            .0
            .iter()
            .map(|(k, v)| (k.clone(), simple_to_property(v)))
            .collect::<BTreeMap<_, _>>();
    }

    (descriptor.body, descriptor.body_section) = capture_body(&message.body);
    descriptor
}

/// Build the wire message for a send.
pub fn to_amqp_parts(
    message: &OutboundMessage,
) -> (Option<Header>, Option<MessageAnnotations>, Properties, ApplicationProperties) {
    let header = message.time_to_live.map(|ttl| Header {
        ttl: Some(u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)),
        ..Header::default()
    });

    let annotations = message.partition_key.as_ref().map(|key| {
        let mut map = OrderedMap::new();
        map.insert(
            OwnedKey::Symbol(Symbol::from(PARTITION_KEY_ANNOTATION)),
            Value::String(key.clone()),
        );
        MessageAnnotations(map)
    });

    let properties = Properties {
        message_id: message.message_id.clone().map(MessageId::String),
        correlation_id: message.correlation_id.clone().map(MessageId::String),
        subject: message.subject.clone(),
        reply_to: message.reply_to.clone(),
        reply_to_group_id: message.reply_to_session_id.clone(),
        group_id: message.session_id.clone(),
        content_type: message.content_type.clone().map(Symbol::from),
        ..Properties::default()
    };

    let mut app = OrderedMap::new();
    for (key, value) in &message.application_properties {
        app.insert(key.clone(), property_to_simple(value));
    }

    (header, annotations, properties, ApplicationProperties(app))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_sequence(value: Value) -> AmqpMessage {
        let mut annotations = OrderedMap::new();
        annotations.insert(
            OwnedKey::Symbol(Symbol::from(SEQUENCE_NUMBER_ANNOTATION)),
            value,
        );
        Message::builder()
            .message_annotations(MessageAnnotations(annotations))
            .properties(Properties {
                group_id: Some("abc".into()),
                message_id: Some(MessageId::String("m-1".into())),
                ..Properties::default()
            })
            .body(Body::Value(AmqpValue(Value::String("hello".into()))))
            .build()
    }

    #[test]
    fn reads_sequence_and_session() {
        let message = message_with_sequence(Value::Long(77));
        let descriptor = to_descriptor(&message);
        assert_eq!(descriptor.sequence_number, 77);
        assert_eq!(descriptor.session_id.as_deref(), Some("abc"));
        assert_eq!(descriptor.message_id.as_deref(), Some("m-1"));
        assert_eq!(descriptor.body, b"hello");
    }

    #[test]
    fn string_sequence_annotation_is_tolerated() {
        let message = message_with_sequence(Value::String("12".into()));
        assert_eq!(sequence_number(&message), Some(12));
    }

    #[test]
    fn outbound_parts_carry_session_and_properties() {
        let mut outbound = OutboundMessage {
            session_id: Some("s1".into()),
            partition_key: Some("p1".into()),
            time_to_live: Some(Duration::from_secs(60)),
            ..OutboundMessage::default()
        };
        outbound
            .application_properties
            .insert("OriginalSequenceNumber".into(), PropertyValue::Long(5));

        let (header, annotations, properties, app) = to_amqp_parts(&outbound);
        assert_eq!(header.and_then(|h| h.ttl), Some(60_000));
        assert!(annotations.is_some());
        assert_eq!(properties.group_id.as_deref(), Some("s1"));
        assert_eq!(app.0.len(), 1);
    }

    #[test]
    fn sequence_body_is_resent_as_a_sequence() {
        let sections = vec![
            AmqpSequence(vec![Value::Int(1), Value::String("two".into())]),
            AmqpSequence(vec![Value::Bool(true)]),
        ];
        let message: AmqpMessage = Message::builder()
            .body(Body::Sequence(Batch::new(sections.clone())))
            .build();

        let descriptor = to_descriptor(&message);
        assert!(matches!(descriptor.body_section, BodySection::Sequence(ref s) if s.len() == 2));
        assert_eq!(descriptor.body, br#"[[1,"two"],[true]]"#);

        let outbound = OutboundMessage {
            body: descriptor.body.clone(),
            body_section: descriptor.body_section.clone(),
            ..OutboundMessage::default()
        };
        assert_eq!(wire_body(&outbound).unwrap(), Body::Sequence(Batch::new(sections)));
    }

    #[test]
    fn map_value_body_displays_as_json_and_resends_as_value() {
        let mut map = OrderedMap::new();
        map.insert(Value::String("k".into()), Value::Int(1));
        let message: AmqpMessage = Message::builder()
            .body(Body::Value(AmqpValue(Value::Map(map.clone()))))
            .build();

        let descriptor = to_descriptor(&message);
        assert_eq!(descriptor.body, br#"{"k":1}"#);

        let outbound = OutboundMessage {
            body_section: descriptor.body_section,
            ..OutboundMessage::default()
        };
        assert_eq!(
            wire_body(&outbound).unwrap(),
            Body::Value(AmqpValue(Value::Map(map)))
        );
    }

    #[test]
    fn data_body_is_concatenated_and_resent_as_data() {
        let message: AmqpMessage = Message::builder()
            .body(Body::Data(Batch::new(vec![
                Data(Binary::from(b"ab".to_vec())),
                Data(Binary::from(b"cd".to_vec())),
            ])))
            .build();
        let descriptor = to_descriptor(&message);
        assert_eq!(descriptor.body, b"abcd");
        assert_eq!(descriptor.body_section, BodySection::Data);

        let outbound = OutboundMessage {
            body: descriptor.body,
            ..OutboundMessage::default()
        };
        assert_eq!(
            wire_body(&outbound).unwrap(),
            Body::Data(Batch::new(vec![Data(Binary::from(b"abcd".to_vec()))]))
        );
    }

    #[test]
    fn opaque_body_is_refused() {
        let outbound = OutboundMessage {
            body_section: BodySection::Opaque("amqp-value".into()),
            ..OutboundMessage::default()
        };
        assert!(matches!(wire_body(&outbound), Err(TransportError::Protocol(_))));
    }
}
