//! # Message Model
//!
//! A message is a typed view over a [`Packet`]: one struct with a kind tag
//! covering the three concrete flavors (plain, text, bytes). Accessors
//! proxy to the wrapped packet; the body interpretation is the only thing
//! the kind changes. Decoding dispatches on the packet type and rejects
//! anything outside the supported message family.
//!
//! Messages created by the application own their packet until a send;
//! messages delivered by the library carry the broker-assigned system
//! message id, the consumer they arrived on, and a one-way `ack_processed`
//! flag flipped when the message first contributes to an acknowledgement
//! block.

use crate::error::{MqError, MqResult};
use crate::packet::{now_millis, Packet, PacketType, SysMessageId};
use crate::properties::Properties;

/// Lowest allowed message priority.
pub const MIN_PRIORITY: u8 = 0;
/// Highest allowed message priority.
pub const MAX_PRIORITY: u8 = 9;
/// Priority given to messages that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 4;

/// JMS delivery mode. The numeric values are broker-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeliveryMode {
    NonPersistent = 1,
    Persistent = 2,
}

impl DeliveryMode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> MqResult<Self> {
        match code {
            1 => Ok(DeliveryMode::NonPersistent),
            2 => Ok(DeliveryMode::Persistent),
            _ => Err(MqError::InvalidDeliveryMode),
        }
    }
}

/// Concrete message flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Plain,
    Text,
    Bytes,
}

impl MessageKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            MessageKind::Plain => PacketType::Message,
            MessageKind::Text => PacketType::TextMessage,
            MessageKind::Bytes => PacketType::BytesMessage,
        }
    }
}

/// A JMS message over one packet.
#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    packet: Packet,
    /// Session id recorded when the library hands the message to a
    /// consumer; `None` for application-created messages.
    session_id: Option<u64>,
    ack_processed: bool,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        let mut packet = Packet::new(kind.packet_type());
        packet.priority = DEFAULT_PRIORITY;
        packet.timestamp = now_millis();
        Self {
            kind,
            packet,
            session_id: None,
            ack_processed: false,
        }
    }

    pub fn new_plain() -> Self {
        Self::new(MessageKind::Plain)
    }

    pub fn new_text() -> Self {
        Self::new(MessageKind::Text)
    }

    pub fn new_bytes() -> Self {
        Self::new(MessageKind::Bytes)
    }

    /// Wraps an inbound packet, dispatching on its type.
    pub fn from_packet(packet: Packet) -> MqResult<Self> {
        let kind = match packet.packet_type() {
            PacketType::TextMessage => MessageKind::Text,
            PacketType::BytesMessage => MessageKind::Bytes,
            PacketType::Message => MessageKind::Plain,
            _ => return Err(MqError::UnsupportedMessageType),
        };
        Ok(Self {
            kind,
            packet,
            session_id: None,
            ack_processed: false,
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    /// Surrenders the wrapped packet (send path).
    pub fn into_packet(self) -> Packet {
        self.packet
    }

    // --- body ---

    /// Sets the text body. Only valid on text messages.
    pub fn set_text(&mut self, text: &str) -> MqResult<()> {
        if self.kind != MessageKind::Text {
            return Err(MqError::UnsupportedMessageType);
        }
        self.packet.body = text.as_bytes().to_vec();
        Ok(())
    }

    /// Returns the text body. Only valid on text messages.
    pub fn text(&self) -> MqResult<&str> {
        if self.kind != MessageKind::Text {
            return Err(MqError::UnsupportedMessageType);
        }
        std::str::from_utf8(&self.packet.body).map_err(|_| MqError::InvalidPacketField)
    }

    /// Sets the byte body. Only valid on bytes messages.
    pub fn set_bytes(&mut self, bytes: &[u8]) -> MqResult<()> {
        if self.kind != MessageKind::Bytes {
            return Err(MqError::UnsupportedMessageType);
        }
        self.packet.body = bytes.to_vec();
        Ok(())
    }

    /// Returns the byte body. Only valid on bytes messages.
    pub fn bytes(&self) -> MqResult<&[u8]> {
        if self.kind != MessageKind::Bytes {
            return Err(MqError::UnsupportedMessageType);
        }
        Ok(&self.packet.body)
    }

    // --- user properties and headers ---

    pub fn properties(&self) -> &Properties {
        &self.packet.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.packet.properties
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.packet.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: &str) {
        self.packet.correlation_id = Some(id.to_string());
    }

    /// Application-defined JMS message type tag.
    pub fn jms_type(&self) -> Option<&str> {
        self.packet.message_type.as_deref()
    }

    pub fn set_jms_type(&mut self, tag: &str) {
        self.packet.message_type = Some(tag.to_string());
    }

    /// Reply-to destination `(name, class_name)`, if set.
    pub fn reply_to(&self) -> Option<(&str, &str)> {
        match (&self.packet.reply_to, &self.packet.reply_to_class) {
            (Some(name), Some(class)) => Some((name, class)),
            _ => None,
        }
    }

    /// Stores the reply-to destination. Both the name and the class name
    /// are cloned into packet-owned storage.
    pub fn set_reply_to(&mut self, dest: &crate::destination::Destination) -> MqResult<()> {
        let name = dest.name()?;
        self.packet.reply_to = Some(name.to_string());
        self.packet.reply_to_class = Some(dest.class_name().to_string());
        Ok(())
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.packet.persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::NonPersistent
        }
    }

    pub fn set_delivery_mode(&mut self, mode: DeliveryMode) {
        self.packet.persistent = mode == DeliveryMode::Persistent;
    }

    pub fn priority(&self) -> u8 {
        self.packet.priority
    }

    /// Sets the priority, rejecting values outside `0..=9`.
    pub fn set_priority(&mut self, priority: u8) -> MqResult<()> {
        if priority > MAX_PRIORITY {
            return Err(MqError::InvalidPriority);
        }
        self.packet.priority = priority;
        Ok(())
    }

    pub fn timestamp(&self) -> u64 {
        self.packet.timestamp
    }

    pub fn expiration(&self) -> u64 {
        self.packet.expiration
    }

    pub fn redelivered(&self) -> bool {
        self.packet.redelivered
    }

    pub fn set_redelivered(&mut self, redelivered: bool) {
        self.packet.redelivered = redelivered;
    }

    pub fn destination_name(&self) -> Option<&str> {
        self.packet.destination.as_deref()
    }

    /// Broker-assigned id; null until the broker stamps it.
    pub fn sys_message_id(&self) -> SysMessageId {
        self.packet.sys_message_id
    }

    /// Consumer the message was delivered on; 0 for outbound messages.
    pub fn consumer_id(&self) -> u64 {
        self.packet.consumer_id
    }

    /// True once the expiration is set and in the past.
    pub fn is_expired(&self) -> bool {
        let expiration = self.packet.expiration;
        expiration != 0 && now_millis() >= expiration
    }

    // --- delivery bookkeeping ---

    /// Records the session a received message was delivered through.
    /// Set once by the delivery path.
    pub fn set_delivering_session(&mut self, session_id: u64) {
        debug_assert!(self.session_id.is_none());
        self.session_id = Some(session_id);
    }

    pub fn delivering_session(&self) -> Option<u64> {
        self.session_id
    }

    /// One-way flag: the message has contributed to an ack block.
    pub fn mark_ack_processed(&mut self) {
        self.ack_processed = true;
    }

    pub fn ack_processed(&self) -> bool {
        self.ack_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{Destination, DestinationKind};

    #[test]
    fn test_fresh_plain_message_is_empty() {
        let message = Message::new_plain();
        assert_eq!(message.kind(), MessageKind::Plain);
        assert!(message.packet().body.is_empty());
        assert_eq!(message.properties().keys().count(), 0);
        assert_eq!(message.priority(), DEFAULT_PRIORITY);
        assert_eq!(message.delivery_mode(), DeliveryMode::NonPersistent);
        assert!(message.sys_message_id().is_null());
    }

    #[test]
    fn test_text_round_trip_with_property() {
        let mut message = Message::new_text();
        message.set_text("hello").unwrap();
        message.properties_mut().set_int32("k", 42);

        assert_eq!(message.text().unwrap(), "hello");
        assert_eq!(message.properties().get_int32("k").unwrap(), 42);
    }

    #[test]
    fn test_body_accessors_check_the_kind() {
        let mut text = Message::new_text();
        assert_eq!(text.set_bytes(b"xx"), Err(MqError::UnsupportedMessageType));
        assert_eq!(text.bytes(), Err(MqError::UnsupportedMessageType));

        let bytes = Message::new_bytes();
        assert_eq!(bytes.text(), Err(MqError::UnsupportedMessageType));
    }

    #[test]
    fn test_priority_range() {
        let mut message = Message::new_text();
        message.set_priority(9).unwrap();
        assert_eq!(message.priority(), 9);
        assert_eq!(message.set_priority(10), Err(MqError::InvalidPriority));
        assert_eq!(message.priority(), 9);
    }

    #[test]
    fn test_from_packet_dispatch() {
        let text = Message::from_packet(Packet::new(PacketType::TextMessage)).unwrap();
        assert_eq!(text.kind(), MessageKind::Text);

        let bytes = Message::from_packet(Packet::new(PacketType::BytesMessage)).unwrap();
        assert_eq!(bytes.kind(), MessageKind::Bytes);

        let plain = Message::from_packet(Packet::new(PacketType::Message)).unwrap();
        assert_eq!(plain.kind(), MessageKind::Plain);

        assert!(matches!(
            Message::from_packet(Packet::new(PacketType::Acknowledge)),
            Err(MqError::UnsupportedMessageType)
        ));
    }

    #[test]
    fn test_expiration() {
        let mut message = Message::new_text();
        assert!(!message.is_expired());

        message.packet_mut().expiration = 1;
        assert!(message.is_expired());

        message.packet_mut().expiration = now_millis() + 60_000;
        assert!(!message.is_expired());
    }

    #[test]
    fn test_reply_to_clones_name_and_class() {
        let dest = Destination::new("replies", DestinationKind::Queue, false);
        let mut message = Message::new_text();
        message.set_reply_to(&dest).unwrap();

        let (name, class) = message.reply_to().unwrap();
        assert_eq!(name, "replies");
        assert_eq!(class, crate::destination::QUEUE_CLASS_NAME);
        // The message owns its copies; mutating the source is irrelevant.
        drop(dest);
        assert!(message.reply_to().is_some());
    }

    #[test]
    fn test_ack_processed_is_one_way() {
        let mut message = Message::new_text();
        assert!(!message.ack_processed());
        message.mark_ack_processed();
        assert!(message.ack_processed());
    }
}
