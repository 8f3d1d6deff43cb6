//! # Error Types and Status Codes
//!
//! This module defines the single error space used throughout the client.
//! Every failure the library can report maps onto one numeric status code:
//! a base of 1000 plus a dense subcode identifying the failing subsystem.
//! The numeric values are frozen: they are visible to foreign callers
//! through language bindings and must never be renumbered.
//!
//! ## Subcode blocks
//!
//! - `1xx` general (memory, lookup, concurrency)
//! - `5xx` property bag
//! - `6xx` TCP
//! - `8xx` packet validation
//! - `9xx` broker connection
//! - `11xx` sockets and SSL
//! - `13xx` broker-reported HTTP-like statuses
//! - `14xx` protocol handler verbs
//! - `18xx` session state
//! - `19xx` destinations
//! - `20xx` producers
//! - `21xx` consumers
//! - `22xx` connection setup
//! - `23xx` handle registry
//! - `25xx` temporary destinations
//! - `26xx` user callbacks

use thiserror::Error;

/// Result alias used by every fallible operation in the crate.
pub type MqResult<T> = Result<T, MqError>;

/// Base value all status codes are offset from.
pub const BASE_ERROR_CODE: u32 = 1000;

/// Errors reported by the client library.
///
/// Each variant carries a fixed numeric status code retrievable via
/// [`MqError::code`]. Variants are grouped by the subsystem that raises
/// them; the broker-status group mirrors the HTTP-like status line the
/// broker places on reply packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqError {
    // --- general ---
    #[error("internal error")]
    Internal,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not found")]
    NotFound,
    #[error("concurrent access")]
    ConcurrentAccess,
    #[error("caller does not own the session mutex")]
    ConcurrentNotOwner,

    // --- property bag ---
    #[error("property exists with a different value type")]
    PropertyWrongValueType,
    #[error("property file could not be parsed")]
    PropertyFileError,
    #[error("file not found")]
    FileNotFound,

    // --- tcp ---
    #[error("invalid TCP port")]
    TcpInvalidPort,
    #[error("TCP connection closed")]
    TcpConnectionClosed,

    // --- packet validation ---
    #[error("invalid packet")]
    InvalidPacket,
    #[error("invalid packet field")]
    InvalidPacketField,
    #[error("unrecognized packet type")]
    UnrecognizedPacketType,
    #[error("unsupported message type")]
    UnsupportedMessageType,

    // --- broker connection ---
    #[error("could not connect to broker")]
    CouldNotConnectToBroker,
    #[error("broker connection closed")]
    BrokerConnectionClosed,
    #[error("unexpected acknowledgement")]
    UnexpectedAcknowledgement,

    // --- sockets / ssl ---
    #[error("socket error")]
    SocketError,
    #[error("timeout expired")]
    TimeoutExpired,
    #[error("invalid port")]
    InvalidPort,
    #[error("socket connect failed")]
    SocketConnectFailed,
    #[error("socket read failed")]
    SocketReadFailed,
    #[error("socket write failed")]
    SocketWriteFailed,
    #[error("socket shutdown failed")]
    SocketShutdownFailed,
    #[error("SSL initialization failed")]
    SslInitError,
    #[error("SSL error")]
    SslError,
    #[error("SSL not initialized")]
    SslNotInitialized,

    // --- broker-reported statuses ---
    #[error("broker: bad request")]
    BrokerBadRequest,
    #[error("broker: unauthorized")]
    BrokerUnauthorized,
    #[error("broker: forbidden")]
    BrokerForbidden,
    #[error("broker: not found")]
    BrokerNotFound,
    #[error("broker: not allowed")]
    BrokerNotAllowed,
    #[error("broker: timeout")]
    BrokerTimeout,
    #[error("broker: conflict")]
    BrokerConflict,
    #[error("broker: gone")]
    BrokerGone,
    #[error("broker: precondition failed")]
    BrokerPreconditionFailed,
    #[error("broker: invalid login")]
    BrokerInvalidLogin,
    #[error("broker: error")]
    BrokerError,
    #[error("broker: not implemented")]
    BrokerNotImplemented,
    #[error("broker: unavailable")]
    BrokerUnavailable,
    #[error("broker: bad protocol version")]
    BrokerBadVersion,
    #[error("broker: resource full")]
    BrokerResourceFull,
    #[error("broker: entity too large")]
    BrokerEntityTooLarge,

    // --- protocol handler ---
    #[error("goodbye failed")]
    ProtocolHandlerGoodbyeFailed,
    #[error("start failed")]
    ProtocolHandlerStartFailed,
    #[error("stop failed")]
    ProtocolHandlerStopFailed,
    #[error("authentication failed")]
    ProtocolHandlerAuthenticateFailed,
    #[error("unexpected reply packet")]
    ProtocolHandlerUnexpectedReply,
    #[error("protocol write failed")]
    ProtocolHandlerWriteError,
    #[error("protocol read failed")]
    ProtocolHandlerReadError,
    #[error("protocol handler error")]
    ProtocolHandlerError,
    #[error("set client id failed")]
    ProtocolHandlerSetClientIdFailed,
    #[error("delete destination failed")]
    ProtocolHandlerDeleteDestinationFailed,
    #[error("hello failed")]
    ProtocolHandlerHelloFailed,
    #[error("resume flow failed")]
    ProtocolHandlerResumeFlowFailed,

    // --- read channel ---
    #[error("read channel dispatch error")]
    ReadChannelDispatchError,

    #[error("unsupported argument value")]
    UnsupportedArgumentValue,

    // --- session state ---
    #[error("session closed")]
    SessionClosed,
    #[error("producer does not belong to this session")]
    ProducerNotInSession,
    #[error("queue consumer cannot be durable")]
    QueueConsumerCannotBeDurable,
    #[error("cannot unsubscribe a subscription with an active consumer")]
    CannotUnsubscribeActiveConsumer,
    #[error("receive queue closed")]
    ReceiveQueueClosed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid acknowledge mode")]
    InvalidAckMode,
    #[error("invalid destination type")]
    InvalidDestinationType,
    #[error("invalid receive mode")]
    InvalidReceiveMode,
    #[error("session is not in synchronous receive mode")]
    NotSyncReceiveMode,
    #[error("session is not in asynchronous receive mode")]
    NotAsyncReceiveMode,
    #[error("operation invalid on a transacted session")]
    TransactedSession,
    #[error("session is not transacted")]
    NotTransactedSession,
    #[error("session is not in client acknowledge mode")]
    SessionNotClientAckMode,
    #[error("invalid transaction id")]
    InvalidTransactionId,
    #[error("shared subscription requires a topic")]
    SharedSubscriptionNotTopic,

    // --- destinations ---
    #[error("message has no destination")]
    MessageNoDestination,
    #[error("destination has no name")]
    DestinationNoName,

    // --- producers ---
    #[error("producer has no destination")]
    ProducerNoDestination,
    #[error("producer already has a destination")]
    ProducerHasDestination,
    #[error("invalid delivery mode")]
    InvalidDeliveryMode,
    #[error("priority outside the valid range 0..=9")]
    InvalidPriority,
    #[error("producer closed")]
    ProducerClosed,

    // --- consumers ---
    #[error("durable consumer requires a subscription name")]
    ConsumerNoDurableName,
    #[error("consumer exception")]
    ConsumerException,
    #[error("no message")]
    NoMessage,
    #[error("consumer closed")]
    ConsumerClosed,
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error("no-local durable consumer requires a client id")]
    NoLocalDurableConsumerNoClientId,
    #[error("shared consumer requires a subscription name")]
    ConsumerNoSubscriptionName,

    // --- connection setup ---
    #[error("unsupported transport")]
    ConnectionUnsupportedTransport,

    // --- handle registry ---
    #[error("invalid handle")]
    InvalidHandle,
    #[error("handle is still referenced")]
    HandleInUse,
    #[error("no more handles")]
    NoMoreHandles,

    // --- temporary destinations ---
    #[error("destination is not temporary")]
    DestinationNotTemporary,
    #[error("temporary destination belongs to another connection")]
    TemporaryDestinationNotInConnection,

    // --- user callbacks ---
    #[error("message listener reported a runtime error")]
    CallbackRuntimeError,
}

impl MqError {
    /// Numeric status code for this error.
    ///
    /// The values are part of the external contract: they may cross an ABI
    /// boundary into existing foreign-language callers.
    pub fn code(&self) -> u32 {
        use MqError::*;
        let sub = match self {
            Internal => 1,
            OutOfMemory => 102,
            NotFound => 104,
            ConcurrentAccess => 116,
            ConcurrentNotOwner => 118,

            PropertyWrongValueType => 501,
            PropertyFileError => 505,
            FileNotFound => 506,

            TcpInvalidPort => 600,
            TcpConnectionClosed => 601,

            InvalidPacket => 800,
            InvalidPacketField => 801,
            UnrecognizedPacketType => 803,
            UnsupportedMessageType => 804,

            CouldNotConnectToBroker => 900,
            BrokerConnectionClosed => 901,
            UnexpectedAcknowledgement => 902,

            SocketError => 1100,
            TimeoutExpired => 1103,
            InvalidPort => 1104,
            SocketConnectFailed => 1105,
            SocketReadFailed => 1106,
            SocketWriteFailed => 1107,
            SocketShutdownFailed => 1108,
            SslInitError => 1110,
            SslError => 1113,
            SslNotInitialized => 1115,

            BrokerBadRequest => 1300,
            BrokerUnauthorized => 1301,
            BrokerForbidden => 1302,
            BrokerNotFound => 1303,
            BrokerNotAllowed => 1304,
            BrokerTimeout => 1305,
            BrokerConflict => 1306,
            BrokerGone => 1307,
            BrokerPreconditionFailed => 1308,
            BrokerInvalidLogin => 1309,
            BrokerError => 1310,
            BrokerNotImplemented => 1311,
            BrokerUnavailable => 1312,
            BrokerBadVersion => 1313,
            BrokerResourceFull => 1314,
            BrokerEntityTooLarge => 1315,

            ProtocolHandlerGoodbyeFailed => 1400,
            ProtocolHandlerStartFailed => 1401,
            ProtocolHandlerStopFailed => 1402,
            ProtocolHandlerAuthenticateFailed => 1403,
            ProtocolHandlerUnexpectedReply => 1404,
            ProtocolHandlerWriteError => 1405,
            ProtocolHandlerReadError => 1406,
            ProtocolHandlerError => 1407,
            ProtocolHandlerSetClientIdFailed => 1408,
            ProtocolHandlerDeleteDestinationFailed => 1409,
            ProtocolHandlerHelloFailed => 1410,
            ProtocolHandlerResumeFlowFailed => 1411,

            ReadChannelDispatchError => 1500,

            UnsupportedArgumentValue => 1700,

            SessionClosed => 1800,
            ProducerNotInSession => 1802,
            QueueConsumerCannotBeDurable => 1803,
            CannotUnsubscribeActiveConsumer => 1804,
            ReceiveQueueClosed => 1805,
            ConnectionClosed => 1808,
            InvalidAckMode => 1809,
            InvalidDestinationType => 1810,
            InvalidReceiveMode => 1811,
            NotSyncReceiveMode => 1812,
            NotAsyncReceiveMode => 1813,
            TransactedSession => 1814,
            NotTransactedSession => 1815,
            SessionNotClientAckMode => 1816,
            InvalidTransactionId => 1818,
            SharedSubscriptionNotTopic => 1822,

            MessageNoDestination => 1900,
            DestinationNoName => 1902,

            ProducerNoDestination => 2000,
            ProducerHasDestination => 2001,
            InvalidDeliveryMode => 2002,
            InvalidPriority => 2003,
            ProducerClosed => 2004,

            ConsumerNoDurableName => 2100,
            ConsumerException => 2102,
            NoMessage => 2105,
            ConsumerClosed => 2106,
            ConsumerNotFound => 2108,
            NoLocalDurableConsumerNoClientId => 2111,
            ConsumerNoSubscriptionName => 2112,

            ConnectionUnsupportedTransport => 2203,

            InvalidHandle => 2300,
            HandleInUse => 2301,
            NoMoreHandles => 2302,

            DestinationNotTemporary => 2500,
            TemporaryDestinationNotInConnection => 2501,

            CallbackRuntimeError => 2600,
        };
        BASE_ERROR_CODE + sub
    }

    /// Maps an HTTP-like status from a broker reply packet to an error.
    ///
    /// Returns `Ok(())` for the OK status (200). Unknown non-OK statuses
    /// collapse to [`MqError::BrokerError`].
    pub fn check_broker_status(status: u32) -> MqResult<()> {
        match status {
            200 => Ok(()),
            400 => Err(MqError::BrokerBadRequest),
            401 => Err(MqError::BrokerUnauthorized),
            403 => Err(MqError::BrokerForbidden),
            404 => Err(MqError::BrokerNotFound),
            405 => Err(MqError::BrokerNotAllowed),
            408 => Err(MqError::BrokerTimeout),
            409 => Err(MqError::BrokerConflict),
            410 => Err(MqError::BrokerGone),
            412 => Err(MqError::BrokerPreconditionFailed),
            413 => Err(MqError::BrokerEntityTooLarge),
            500 => Err(MqError::BrokerError),
            501 => Err(MqError::BrokerNotImplemented),
            503 => Err(MqError::BrokerUnavailable),
            505 => Err(MqError::BrokerBadVersion),
            507 => Err(MqError::BrokerResourceFull),
            _ => Err(MqError::BrokerError),
        }
    }
}
