//! # Packet Model
//!
//! The unit of exchange with the broker. A [`Packet`] couples a
//! [`PacketType`] with the typed header fields every broker packet carries,
//! two property maps (protocol headers and user properties), and an opaque
//! body. The byte-level wire codec is outside this crate; packets cross the
//! [`Transport`](crate::transport::Transport) seam as whole values and the
//! stand-in framing serializes them with bincode.
//!
//! ## Packet type numbering
//!
//! The first 8 type codes are reserved for the basic JMS message types.
//! After that, even codes are requests and odd codes are replies, which is
//! why the sequence has holes for requests without replies. The numbering
//! is broker-visible and must not change.

use crate::error::{MqError, MqResult};
use crate::properties::Properties;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the broker protocol this client speaks.
pub const PROTOCOL_VERSION: i32 = 500;

/// Broker packet types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PacketType {
    #[default]
    Invalid = 0,

    TextMessage = 1,
    BytesMessage = 2,
    MapMessage = 3,
    StreamMessage = 4,
    ObjectMessage = 5,
    Message = 6,

    SendReply = 9,

    Hello = 10,
    HelloReply = 11,
    Authenticate = 12,
    AuthenticateReply = 13,
    AddConsumer = 14,
    AddConsumerReply = 15,
    DeleteConsumer = 16,
    DeleteConsumerReply = 17,
    AddProducer = 18,
    AddProducerReply = 19,
    Start = 20,

    Stop = 22,
    StopReply = 23,
    Acknowledge = 24,
    AcknowledgeReply = 25,
    Browse = 26,
    BrowseReply = 27,
    Goodbye = 28,
    GoodbyeReply = 29,

    Error = 30,

    Redeliver = 32,

    CreateDestination = 34,
    CreateDestinationReply = 35,
    DestroyDestination = 36,
    DestroyDestinationReply = 37,
    AuthenticateRequest = 38,

    VerifyDestination = 40,
    VerifyDestinationReply = 41,
    Deliver = 42,
    DeliverReply = 43,
    StartTransaction = 44,
    StartTransactionReply = 45,
    CommitTransaction = 46,
    CommitTransactionReply = 47,
    RollbackTransaction = 48,
    RollbackTransactionReply = 49,

    SetClientId = 50,
    SetClientIdReply = 51,

    ResumeFlow = 52,

    Ping = 54,
    PingReply = 55,

    PrepareTransaction = 56,
    PrepareTransactionReply = 57,

    EndTransaction = 58,
    EndTransactionReply = 59,

    RecoverTransaction = 60,
    RecoverTransactionReply = 61,

    GenerateUid = 62,
    GenerateUidReply = 63,

    FlowPaused = 64,

    DeleteProducer = 66,
    DeleteProducerReply = 67,

    CreateSession = 68,
    CreateSessionReply = 69,

    DestroySession = 70,
    DestroySessionReply = 71,

    GetInfo = 72,
    GetInfoReply = 73,

    Debug = 74,
}

impl PacketType {
    /// Wire code of this packet type.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// True for the JMS message family delivered to consumers.
    pub fn is_jms_message(self) -> bool {
        matches!(
            self,
            PacketType::TextMessage
                | PacketType::BytesMessage
                | PacketType::MapMessage
                | PacketType::StreamMessage
                | PacketType::ObjectMessage
                | PacketType::Message
        )
    }

    /// True for reply packets (odd codes above the message family).
    pub fn is_reply(self) -> bool {
        let code = self.code();
        code > 8 && code % 2 == 1
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// Protocol header keys. These names are shared with the broker.
pub const JMQ_STATUS: &str = "JMQStatus";
pub const JMQ_SESSION_ID: &str = "JMQSessionID";
pub const JMQ_CONSUMER_ID: &str = "JMQConsumerID";
pub const JMQ_PRODUCER_ID: &str = "JMQProducerID";
pub const JMQ_TRANSACTION_ID: &str = "JMQTransactionID";
pub const JMQ_SIZE: &str = "JMQSize";
pub const JMQ_BYTES: &str = "JMQBytes";
pub const JMQ_DESTINATION: &str = "JMQDestination";
pub const JMQ_DEST_TYPE: &str = "JMQDestType";
pub const JMQ_DURABLE_NAME: &str = "JMQDurableName";
pub const JMQ_DURABLE: &str = "JMQDurable";
pub const JMQ_SHARE: &str = "JMQShare";
pub const JMQ_NO_LOCAL: &str = "JMQNoLocal";
pub const JMQ_SELECTOR: &str = "JMQSelector";
pub const JMQ_CLIENT_ID: &str = "JMQClientID";
pub const JMQ_PROTOCOL_LEVEL: &str = "JMQProtocolLevel";
pub const JMQ_VERSION: &str = "JMQVersion";
pub const JMQ_PRODUCT: &str = "JMQProduct";
pub const JMQ_USER: &str = "JMQUser";
pub const JMQ_PASSWORD: &str = "JMQPassword";
pub const JMQ_ACK_TYPE: &str = "JMQAckType";
pub const JMQ_REASON: &str = "JMQReason";

/// Ack-type header value for ordinary acknowledgement blocks.
pub const ACK_TYPE_STANDARD: i32 = 0;
/// Ack-type header value for expired (dead) messages.
pub const ACK_TYPE_DEAD: i32 = 1;

/// Broker-assigned globally unique message identifier.
///
/// Assigned when the broker first stores a message; immutable afterwards.
/// Used for acknowledgement blocks and redelivery tracking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SysMessageId {
    pub timestamp: u64,
    pub host: u32,
    pub port: u16,
    pub sequence: u32,
}

impl SysMessageId {
    /// The all-zero id a packet carries before the broker stamps it.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for SysMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID:{}-{}-{}-{}",
            self.sequence, self.host, self.port, self.timestamp
        )
    }
}

/// One message exchanged with the broker.
///
/// Typed fields mirror the fixed packet header; `headers` carries the
/// protocol (`JMQ*`) fields of control packets and `properties` the
/// user-visible message properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sys_message_id: SysMessageId,

    /// Creation time, milliseconds since the epoch.
    pub timestamp: u64,
    /// Absolute expiration, milliseconds since the epoch; 0 never expires.
    pub expiration: u64,
    /// Earliest delivery time, milliseconds since the epoch; 0 immediate.
    pub delivery_time: u64,

    pub priority: u8,
    pub redelivered: bool,
    pub persistent: bool,
    /// Set on the last message of a producer's credit chunk so the broker
    /// schedules a resume-flow.
    pub consumer_flow: bool,

    /// Delivery target on inbound JMS messages; correlation key on control
    /// request/reply pairs.
    pub consumer_id: u64,

    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub destination: Option<String>,
    pub destination_class: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_class: Option<String>,

    pub headers: Properties,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Self {
        Packet {
            packet_type,
            ..Packet::default()
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Broker status on reply packets; defaults to 500 when absent so a
    /// malformed reply maps to a broker error rather than silent success.
    pub fn status(&self) -> u32 {
        self.headers
            .get_int32(JMQ_STATUS)
            .map(|v| v as u32)
            .unwrap_or(500)
    }

    pub fn set_status(&mut self, status: u32) {
        self.headers.set_int32(JMQ_STATUS, status as i32);
    }

    pub fn transaction_id(&self) -> u64 {
        self.headers
            .get_int64(JMQ_TRANSACTION_ID)
            .map(|v| v as u64)
            .unwrap_or(0)
    }

    pub fn set_transaction_id(&mut self, id: u64) {
        self.headers.set_int64(JMQ_TRANSACTION_ID, id as i64);
    }

    pub fn producer_id(&self) -> u64 {
        self.headers
            .get_int64(JMQ_PRODUCER_ID)
            .map(|v| v as u64)
            .unwrap_or(0)
    }

    pub fn set_producer_id(&mut self, id: u64) {
        self.headers.set_int64(JMQ_PRODUCER_ID, id as i64);
    }

    pub fn session_id(&self) -> u64 {
        self.headers
            .get_int64(JMQ_SESSION_ID)
            .map(|v| v as u64)
            .unwrap_or(0)
    }

    pub fn set_session_id(&mut self, id: u64) {
        self.headers.set_int64(JMQ_SESSION_ID, id as i64);
    }

    /// Producer credit granted by AddProducerReply / ResumeFlow:
    /// `(chunk_bytes, chunk_size)`; absent fields mean unbounded.
    pub fn flow_credit(&self) -> (i64, i32) {
        let bytes = self.headers.get_int64(JMQ_BYTES).unwrap_or(-1);
        let size = self.headers.get_int32(JMQ_SIZE).unwrap_or(-1);
        (bytes, size)
    }

    pub fn set_flow_credit(&mut self, chunk_bytes: i64, chunk_size: i32) {
        self.headers.set_int64(JMQ_BYTES, chunk_bytes);
        self.headers.set_int32(JMQ_SIZE, chunk_size);
    }

    /// Serialize the packet for the stand-in frame codec.
    pub fn to_bytes(&self) -> MqResult<Vec<u8>> {
        bincode::serialize(self).map_err(|_| MqError::InvalidPacket)
    }

    /// Deserialize a packet from the stand-in frame codec.
    pub fn from_bytes(bytes: &[u8]) -> MqResult<Self> {
        bincode::deserialize(bytes).map_err(|_| MqError::InvalidPacket)
    }
}

/// One entry of an acknowledgement block: which consumer saw which message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEntry {
    pub consumer_id: u64,
    pub sys_message_id: SysMessageId,
}

/// Serializes an acknowledgement block into a packet body.
pub fn encode_ack_block(entries: &[AckEntry]) -> MqResult<Vec<u8>> {
    bincode::serialize(entries).map_err(|_| MqError::InvalidPacket)
}

/// Reads an acknowledgement block back out of a packet body.
pub fn decode_ack_block(body: &[u8]) -> MqResult<Vec<AckEntry>> {
    bincode::deserialize(body).map_err(|_| MqError::InvalidPacket)
}

/// Milliseconds since the Unix epoch, used for message timestamps and
/// expiration checks.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_codes() {
        assert_eq!(PacketType::TextMessage.code(), 1);
        assert_eq!(PacketType::Acknowledge.code(), 24);
        assert_eq!(PacketType::AcknowledgeReply.code(), 25);
        assert_eq!(PacketType::ResumeFlow.code(), 52);
        assert_eq!(PacketType::FlowPaused.code(), 64);
        assert_eq!(PacketType::GetInfoReply.code(), 73);
    }

    #[test]
    fn test_message_family_classification() {
        assert!(PacketType::TextMessage.is_jms_message());
        assert!(PacketType::Message.is_jms_message());
        assert!(!PacketType::Acknowledge.is_jms_message());
        assert!(!PacketType::HelloReply.is_jms_message());
    }

    #[test]
    fn test_reply_classification() {
        assert!(PacketType::HelloReply.is_reply());
        assert!(PacketType::AddConsumerReply.is_reply());
        assert!(!PacketType::AddConsumer.is_reply());
        // Message family codes are not replies despite being odd.
        assert!(!PacketType::TextMessage.is_reply());
    }

    #[test]
    fn test_packet_round_trip() {
        let mut packet = Packet::new(PacketType::TextMessage);
        packet.consumer_id = 7;
        packet.priority = 4;
        packet.persistent = true;
        packet.destination = Some("orders".to_string());
        packet.properties.set_int32("k", 42);
        packet.body = b"hello".to_vec();

        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.packet_type(), PacketType::TextMessage);
        assert_eq!(decoded.consumer_id, 7);
        assert_eq!(decoded.priority, 4);
        assert!(decoded.persistent);
        assert_eq!(decoded.destination.as_deref(), Some("orders"));
        assert_eq!(decoded.properties.get_int32("k").unwrap(), 42);
        assert_eq!(decoded.body, b"hello");
    }

    #[test]
    fn test_missing_status_reads_as_server_error() {
        let packet = Packet::new(PacketType::HelloReply);
        assert_eq!(packet.status(), 500);
    }

    #[test]
    fn test_ack_block_round_trip() {
        let entries = vec![
            AckEntry {
                consumer_id: 1,
                sys_message_id: SysMessageId {
                    timestamp: 10,
                    host: 1,
                    port: 7676,
                    sequence: 1,
                },
            },
            AckEntry {
                consumer_id: 1,
                sys_message_id: SysMessageId {
                    timestamp: 11,
                    host: 1,
                    port: 7676,
                    sequence: 2,
                },
            },
        ];
        let body = encode_ack_block(&entries).unwrap();
        assert_eq!(decode_ack_block(&body).unwrap(), entries);
    }

    #[test]
    fn test_sys_message_id_display() {
        let id = SysMessageId {
            timestamp: 99,
            host: 2130706433,
            port: 7676,
            sequence: 5,
        };
        assert_eq!(id.to_string(), "ID:5-2130706433-7676-99");
        assert!(SysMessageId::null().is_null());
        assert!(!id.is_null());
    }
}
