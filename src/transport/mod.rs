pub mod amqp;
pub mod connection;
pub mod traits;

pub use connection::{bounded, close_in_background, connect_with_retry, within};
pub use traits::{
    Broker, BrowseLink, CbsLink, CbsRequest, CbsResponse, Connector, DeadLetterDetails, Delivery,
    Endpoint, LinkSession, LockReceiver, LockedMessage, SaslMode, TransportError,
    DEFAULT_AMQPS_PORT,
};
