//! # Handle Registry
//!
//! Foreign code never sees pointers into this library; it sees opaque
//! 32-bit handles. The registry maps each live handle to exactly one
//! exportable object and arbitrates the two ways an object can die:
//!
//! - the library deletes it internally (owner closed it) while foreign
//!   code may still hold references, or
//! - foreign code drops its last reference after the library has already
//!   let go.
//!
//! An object is destroyed when, and only when, both sides have
//! released. Objects registered with the inverse lifecycle live until
//! foreign code deletes them explicitly. The lifecycle is fixed at
//! registration and never changes.
//!
//! One process-wide monitor guards the table and every per-entry
//! bookkeeping field; acquire/release take it briefly and are safe from
//! any thread at any point in an object's life.

use crate::connection::Connection;
use crate::consumer::MessageConsumer;
use crate::destination::Destination;
use crate::error::{MqError, MqResult};
use crate::message::{Message, MessageKind};
use crate::producer::MessageProducer;
use crate::properties::Properties;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Reserved handle value meaning "invalid".
pub const INVALID_HANDLE: u32 = 0xFEEE_FEEE;
/// Lowest handle value the registry allocates.
pub const MIN_HANDLE: u32 = 100;
/// Highest handle value the registry allocates. The range can be narrowed
/// (see [`HandleRegistry::with_range`]) to exercise rollover; the invalid
/// sentinel must stay outside it.
pub const MAX_HANDLE: u32 = 2_000_000_000;

/// Opaque 32-bit object handle handed to foreign code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn invalid() -> Self {
        Handle(INVALID_HANDLE)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_HANDLE
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }
}

/// Discriminant for handle type checking.
///
/// `Message` doubles as the super-kind of the concrete message kinds, so a
/// caller may acquire a text message through either `TextMessage` or
/// `Message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Connection,
    Session,
    Destination,
    Consumer,
    Producer,
    Message,
    TextMessage,
    BytesMessage,
    Properties,
}

impl ObjectKind {
    /// True when an object of kind `actual` satisfies a request for
    /// `requested`.
    fn satisfies(requested: ObjectKind, actual: ObjectKind) -> bool {
        if requested == actual {
            return true;
        }
        requested == ObjectKind::Message
            && matches!(
                actual,
                ObjectKind::TextMessage | ObjectKind::BytesMessage | ObjectKind::Message
            )
    }
}

/// Which side's release finally destroys the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Normal: the library deletes internally; a deferred destroy waits
    /// for the last external release.
    Internal,
    /// Inverse: the object lives until foreign code deletes it.
    External,
}

/// The exportable objects, as one sum type.
#[derive(Clone)]
pub enum Handled {
    Connection(Arc<Connection>),
    Session(Arc<Session>),
    Destination(Arc<Destination>),
    Consumer(Arc<MessageConsumer>),
    Producer(Arc<MessageProducer>),
    Message(Arc<Mutex<Message>>),
    Properties(Arc<Mutex<Properties>>),
}

impl Handled {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Handled::Connection(_) => ObjectKind::Connection,
            Handled::Session(_) => ObjectKind::Session,
            Handled::Destination(_) => ObjectKind::Destination,
            Handled::Consumer(_) => ObjectKind::Consumer,
            Handled::Producer(_) => ObjectKind::Producer,
            Handled::Message(message) => match message.lock().kind() {
                MessageKind::Text => ObjectKind::TextMessage,
                MessageKind::Bytes => ObjectKind::BytesMessage,
                MessageKind::Plain => ObjectKind::Message,
            },
            Handled::Properties(_) => ObjectKind::Properties,
        }
    }
}

struct Entry {
    object: Handled,
    kind: ObjectKind,
    exported: bool,
    external_refs: u32,
    deleted_internally: bool,
    deleted_externally: bool,
    lifecycle: Lifecycle,
}

struct Table {
    entries: HashMap<u32, Entry>,
    next: u32,
    min: u32,
    max: u32,
}

/// Handle table plus its monitor.
pub struct HandleRegistry {
    inner: Mutex<Table>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::with_range(MIN_HANDLE, MAX_HANDLE)
    }

    /// Registry over a narrowed handle range. The range must exclude the
    /// invalid sentinel and hold at least as many handles as objects alive
    /// at once.
    pub fn with_range(min: u32, max: u32) -> Self {
        assert!(min <= max);
        assert!(!(min..=max).contains(&INVALID_HANDLE));
        Self {
            inner: Mutex::new(Table {
                entries: HashMap::new(),
                next: min,
                min,
                max,
            }),
        }
    }

    /// Registers an object and allocates its handle.
    ///
    /// Scans forward from the allocation cursor, wrapping to the bottom of
    /// the range, and fails with [`MqError::NoMoreHandles`] once every
    /// slot is occupied.
    pub fn allocate(
        &self,
        object: Handled,
        exported: bool,
        lifecycle: Lifecycle,
    ) -> MqResult<Handle> {
        let kind = object.kind();
        let mut table = self.inner.lock();

        let span = (table.max - table.min) as u64 + 1;
        if table.entries.len() as u64 >= span {
            return Err(MqError::NoMoreHandles);
        }
        let mut candidate = table.next;
        loop {
            if !table.entries.contains_key(&candidate) {
                break;
            }
            candidate = if candidate >= table.max {
                table.min
            } else {
                candidate + 1
            };
        }
        table.next = if candidate >= table.max {
            table.min
        } else {
            candidate + 1
        };
        table.entries.insert(
            candidate,
            Entry {
                object,
                kind,
                exported,
                external_refs: 0,
                deleted_internally: false,
                deleted_externally: false,
                lifecycle,
            },
        );
        Ok(Handle(candidate))
    }

    /// Borrows an object on behalf of foreign code, incrementing its
    /// external reference count.
    ///
    /// Fails with [`MqError::InvalidHandle`], without touching the
    /// count, when the handle is unknown, the object is not exported,
    /// it is already logically deleted, or its kind satisfies neither
    /// `kind` nor a super-kind of it.
    pub fn acquire_external(&self, handle: Handle, kind: ObjectKind) -> MqResult<Handled> {
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&handle.0)
            .ok_or(MqError::InvalidHandle)?;
        if !entry.exported || entry.deleted_internally || entry.deleted_externally {
            return Err(MqError::InvalidHandle);
        }
        if !ObjectKind::satisfies(kind, entry.kind) {
            return Err(MqError::InvalidHandle);
        }
        entry.external_refs += 1;
        Ok(entry.object.clone())
    }

    /// Returns a foreign borrow. Destroys the object if this was the last
    /// external reference and the deciding side already released.
    pub fn release_external(&self, handle: Handle) -> MqResult<()> {
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&handle.0)
            .ok_or(MqError::InvalidHandle)?;
        if entry.external_refs == 0 {
            return Err(MqError::InvalidHandle);
        }
        entry.external_refs -= 1;

        let destroy = entry.external_refs == 0
            && match entry.lifecycle {
                Lifecycle::Internal => entry.deleted_internally,
                Lifecycle::External => entry.deleted_externally,
            };
        if destroy {
            table.entries.remove(&handle.0);
        }
        Ok(())
    }

    /// Library-side delete. Destroys immediately when no external
    /// reference is out; otherwise defers to the last release.
    pub fn internal_delete(&self, handle: Handle) -> MqResult<()> {
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&handle.0)
            .ok_or(MqError::InvalidHandle)?;
        if entry.external_refs == 0 {
            table.entries.remove(&handle.0);
        } else {
            entry.deleted_internally = true;
        }
        Ok(())
    }

    /// Foreign-code delete entry point.
    ///
    /// For normal-lifecycle objects this is [`Self::internal_delete`]
    /// reached through the handle. Inverse-lifecycle objects record the
    /// external delete and die once the reference count drains.
    pub fn external_delete(&self, handle: Handle) -> MqResult<()> {
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&handle.0)
            .ok_or(MqError::InvalidHandle)?;
        if !entry.exported {
            return Err(MqError::InvalidHandle);
        }
        match entry.lifecycle {
            Lifecycle::Internal => {
                if entry.external_refs == 0 {
                    table.entries.remove(&handle.0);
                } else {
                    entry.deleted_internally = true;
                }
            }
            Lifecycle::External => {
                entry.deleted_externally = true;
                if entry.external_refs == 0 {
                    table.entries.remove(&handle.0);
                }
            }
        }
        Ok(())
    }

    /// Number of live entries, deferred-delete entries included.
    pub fn live_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

/// The process-wide registry used by connections, sessions, consumers,
/// producers, destinations, messages, and property bags.
pub fn registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Exports an application-created message across the binding boundary.
///
/// Exported messages use the inverse lifecycle: the object lives until
/// foreign code deletes it through [`HandleRegistry::external_delete`].
pub fn export_message(message: Message) -> MqResult<Handle> {
    registry().allocate(
        Handled::Message(Arc::new(Mutex::new(message))),
        true,
        Lifecycle::External,
    )
}

/// Exports a property bag across the binding boundary; same lifecycle as
/// [`export_message`].
pub fn export_properties(properties: Properties) -> MqResult<Handle> {
    registry().allocate(
        Handled::Properties(Arc::new(Mutex::new(properties))),
        true,
        Lifecycle::External,
    )
}
