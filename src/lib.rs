//! # OpenMQ Client Library
//!
//! A native Rust client for message brokers speaking the OpenMQ wire
//! protocol. This library provides authenticated connections, sessions
//! with the four JMS acknowledgement modes, synchronous and asynchronous
//! consumers, flow-controlled producers, and the opaque-handle registry
//! used by foreign-language bindings.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod handle;
pub mod logging;
pub mod message;
pub mod packet;
pub mod producer;
pub mod producer_flow;
pub mod properties;
pub mod protocol;
pub mod receive_queue;
pub mod session;
pub mod session_mutex;
pub mod transport;

pub use config::{ConnectionConfig, TransportKind};
pub use connection::{Connection, ConnectionMetadata, ExceptionListener};
pub use consumer::{ConsumerOptions, MessageArrivedCallback, MessageConsumer, MessageListener};
pub use destination::{Destination, DestinationKind};
pub use error::{MqError, MqResult};
pub use handle::{Handle, HandleRegistry, ObjectKind};
pub use message::{DeliveryMode, Message, MessageKind};
pub use producer::{MessageProducer, SendOptions};
pub use properties::{Properties, PropertyValue};
pub use session::{AckMode, ReceiveMode, Session, XaCallbacks};
pub use session_mutex::Wait;

/// The current version of the client library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values, applied by
/// [`ConnectionConfig::default`](crate::ConnectionConfig)
pub mod defaults {
    use std::time::Duration;

    /// Default broker port
    pub const BROKER_PORT: u16 = 7676;

    /// Default bound on synchronous broker exchanges
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    /// Default consumer prefetch window
    pub const PREFETCH_MAX_MSG_COUNT: i32 = 100;

    /// Default prefetch resume threshold, percent
    pub const PREFETCH_THRESHOLD_PERCENT: f64 = 50.0;

    /// Default DUPS_OK acknowledgement batch limit
    pub const DUPS_OK_LIMIT: usize = 10;
}
