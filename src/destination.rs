//! # Destination Model
//!
//! A destination names a queue or topic on the broker, plus the flag for
//! per-connection temporary destinations. Names are immutable once the
//! destination exists. The broker identifies destination flavors by Java
//! class name on the wire; the table here maps the four known class names
//! to `(kind, temporary)` and back.
//!
//! A destination built from an unrecognized class name keeps no name at
//! all, so the mistake surfaces as [`MqError::DestinationNoName`] on first
//! use instead of silently addressing the wrong destination.

use crate::error::{MqError, MqResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const QUEUE_CLASS_NAME: &str = "com.sun.messaging.BasicQueue";
pub const TEMP_QUEUE_CLASS_NAME: &str = "com.sun.messaging.jmq.jmsclient.TemporaryQueueImpl";
pub const TOPIC_CLASS_NAME: &str = "com.sun.messaging.BasicTopic";
pub const TEMP_TOPIC_CLASS_NAME: &str = "com.sun.messaging.jmq.jmsclient.TemporaryTopicImpl";

/// Destination-type bits used in control packet headers.
pub const DEST_TYPE_QUEUE: i32 = 1;
pub const DEST_TYPE_TOPIC: i32 = 2;
pub const DEST_TYPE_TEMPORARY: i32 = 0x10;

/// Name of the broker's dead message queue. A consumer bound to it sees
/// expired messages as ordinary messages.
pub const DEAD_MESSAGE_QUEUE: &str = "mq.sys.dmq";

/// Queue or topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => write!(f, "queue"),
            DestinationKind::Topic => write!(f, "topic"),
        }
    }
}

/// A named queue or topic, possibly temporary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    name: Option<String>,
    kind: DestinationKind,
    temporary: bool,
}

impl Destination {
    pub fn new(name: &str, kind: DestinationKind, temporary: bool) -> Self {
        Self {
            name: Some(name.to_string()),
            kind,
            temporary,
        }
    }

    /// Builds a destination from the broker-side class name.
    ///
    /// An unknown class name produces a destination with no name; every
    /// later name access fails with [`MqError::DestinationNoName`].
    pub fn from_class_name(name: &str, class_name: &str) -> Self {
        let (kind, temporary) = match class_name {
            QUEUE_CLASS_NAME => (DestinationKind::Queue, false),
            TEMP_QUEUE_CLASS_NAME => (DestinationKind::Queue, true),
            TOPIC_CLASS_NAME => (DestinationKind::Topic, false),
            TEMP_TOPIC_CLASS_NAME => (DestinationKind::Topic, true),
            _ => {
                return Self {
                    name: None,
                    kind: DestinationKind::Queue,
                    temporary: false,
                }
            }
        };
        Self {
            name: Some(name.to_string()),
            kind,
            temporary,
        }
    }

    /// The destination name, or [`MqError::DestinationNoName`] for a
    /// destination that never initialized properly.
    pub fn name(&self) -> MqResult<&str> {
        self.name.as_deref().ok_or(MqError::DestinationNoName)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Broker-side class name for this destination flavor.
    pub fn class_name(&self) -> &'static str {
        match (self.kind, self.temporary) {
            (DestinationKind::Queue, false) => QUEUE_CLASS_NAME,
            (DestinationKind::Queue, true) => TEMP_QUEUE_CLASS_NAME,
            (DestinationKind::Topic, false) => TOPIC_CLASS_NAME,
            (DestinationKind::Topic, true) => TEMP_TOPIC_CLASS_NAME,
        }
    }

    /// Deep copy detached from any session, rebuilt through the class-name
    /// constructor. Returns `None` when the source is invalid or the copy
    /// does not faithfully reproduce name and class.
    pub fn clone_detached(&self) -> Option<Destination> {
        let name = self.name.as_deref()?;
        let clone = Destination::from_class_name(name, self.class_name());
        if clone.name.as_deref() != Some(name) || clone.class_name() != self.class_name() {
            return None;
        }
        Some(clone)
    }

    /// Header bits describing this destination in control packets.
    pub fn dest_type_bits(&self) -> i32 {
        let mut bits = match self.kind {
            DestinationKind::Queue => DEST_TYPE_QUEUE,
            DestinationKind::Topic => DEST_TYPE_TOPIC,
        };
        if self.temporary {
            bits |= DEST_TYPE_TEMPORARY;
        }
        bits
    }

    /// True iff this is the broker's dead message queue.
    pub fn is_dead_message_queue(&self) -> bool {
        self.name.as_deref() == Some(DEAD_MESSAGE_QUEUE)
    }
}
