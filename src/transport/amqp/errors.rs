//! Classification of `fe2o3-amqp` errors.
//!
//! Only a lost session or connection is [`TransportError::Disconnected`]; the
//! broker resets its shared connection on that variant alone. A detached link
//! leaves the session usable and maps to [`TransportError::Protocol`].

use crate::transport::TransportError;
use fe2o3_amqp::connection::{self, OpenError};
use fe2o3_amqp::link::{
    DetachError, IllegalLinkStateError, LinkStateError, ReceiverAttachError, RecvError,
    SendError, SenderAttachError,
};
use fe2o3_amqp::session::{self, BeginError};
use fe2o3_amqp::types::definitions::{self, AmqpError, ErrorCondition};

fn is_unauthorized(error: &definitions::Error) -> bool {
    matches!(
        error.condition,
        ErrorCondition::AmqpError(AmqpError::UnauthorizedAccess)
    )
}

/// A remote error on a link: unauthorized or protocol, never a lost session.
fn remote_link_error(error: &definitions::Error, text: String) -> TransportError {
    if is_unauthorized(error) {
        TransportError::Unauthorized(text)
    } else {
        TransportError::Protocol(text)
    }
}

impl From<IllegalLinkStateError> for TransportError {
    fn from(err: IllegalLinkStateError) -> Self {
        let text = err.to_string();
        match err {
            IllegalLinkStateError::IllegalSessionState => Self::Disconnected(text),
            IllegalLinkStateError::IllegalState => Self::Protocol(text),
        }
    }
}

impl From<DetachError> for TransportError {
    fn from(err: DetachError) -> Self {
        let text = err.to_string();
        match &err {
            DetachError::IllegalSessionState => Self::Disconnected(text),
            DetachError::RemoteDetachedWithError(e) | DetachError::RemoteClosedWithError(e) => {
                remote_link_error(e, text)
            }
            _ => Self::Protocol(text),
        }
    }
}

impl From<LinkStateError> for TransportError {
    fn from(err: LinkStateError) -> Self {
        let text = err.to_string();
        match &err {
            LinkStateError::IllegalSessionState => Self::Disconnected(text),
            LinkStateError::RemoteDetachedWithError(e) | LinkStateError::RemoteClosedWithError(e) => {
                remote_link_error(e, text)
            }
            _ => Self::Protocol(text),
        }
    }
}

impl From<SenderAttachError> for TransportError {
    fn from(err: SenderAttachError) -> Self {
        let text = err.to_string();
        match &err {
            SenderAttachError::IllegalSessionState => Self::Disconnected(text),
            SenderAttachError::RemoteClosedWithError(e) => remote_link_error(e, text),
            _ => Self::Protocol(text),
        }
    }
}

impl From<ReceiverAttachError> for TransportError {
    fn from(err: ReceiverAttachError) -> Self {
        let text = err.to_string();
        match &err {
            ReceiverAttachError::IllegalSessionState => Self::Disconnected(text),
            ReceiverAttachError::RemoteClosedWithError(e) => remote_link_error(e, text),
            _ => Self::Protocol(text),
        }
    }
}

impl From<SendError> for TransportError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::LinkStateError(inner) => inner.into(),
            SendError::Detached(inner) => inner.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<RecvError> for TransportError {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::LinkStateError(inner) => inner.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<OpenError> for TransportError {
    fn from(err: OpenError) -> Self {
        let text = err.to_string();
        match err {
            OpenError::SaslError { .. } => Self::Unauthorized(text),
            _ => Self::Disconnected(text),
        }
    }
}

impl From<BeginError> for TransportError {
    fn from(err: BeginError) -> Self {
        let text = err.to_string();
        match &err {
            BeginError::RemoteEndedWithError(e) if is_unauthorized(e) => Self::Unauthorized(text),
            _ => Self::Disconnected(text),
        }
    }
}

impl From<session::Error> for TransportError {
    fn from(err: session::Error) -> Self {
        Self::Disconnected(err.to_string())
    }
}

impl From<connection::Error> for TransportError {
    fn from(err: connection::Error) -> Self {
        Self::Disconnected(err.to_string())
    }
}
