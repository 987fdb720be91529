//! The message type carried between entities.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::msg::types::{EntityName, EntityType};
use crate::msg::wire::{DecodedMessage, MessageFooter, MessageHeader};
use crate::net::connection::ConnectionRef;
use crate::throttle::ThrottlePermit;

pub const PRIO_LOW: u16 = 64;
pub const PRIO_DEFAULT: u16 = 127;
pub const PRIO_HIGH: u16 = 196;
pub const PRIO_HIGHEST: u16 = 255;

/// A typed message with three payload regions.
///
/// `front` conventionally carries the encoded body, `middle` auxiliary
/// metadata and `data` bulk bytes. Regions are reference-counted [`Bytes`],
/// so a message kept for retransmission shares its buffers with the copy
/// being written and no buffer is ever mutated while in flight.
///
/// Received messages hold the throttle budget that admitted them; it is
/// released when the message is dropped.
pub struct Message {
    header: MessageHeader,
    footer: MessageFooter,
    front: Bytes,
    middle: Bytes,
    data: Bytes,
    connection: Option<ConnectionRef>,
    recv_stamp: Option<Instant>,
    throttle_permits: Vec<ThrottlePermit>,
    dispatch_permit: Option<ThrottlePermit>,
}

impl Message {
    pub fn new(msg_type: u16) -> Self {
        let src = EntityName::new(EntityType::Client, EntityName::NEW);
        let mut header = MessageHeader::new(msg_type, src);
        header.priority = PRIO_DEFAULT;
        Self {
            header,
            footer: MessageFooter::default(),
            front: Bytes::new(),
            middle: Bytes::new(),
            data: Bytes::new(),
            connection: None,
            recv_stamp: None,
            throttle_permits: Vec::new(),
            dispatch_permit: None,
        }
    }

    pub fn with_front(mut self, front: impl Into<Bytes>) -> Self {
        self.front = front.into();
        self
    }

    pub fn with_middle(mut self, middle: impl Into<Bytes>) -> Self {
        self.middle = middle.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.header.priority = priority;
        self
    }

    /// Transfer id. Receivers may post a buffer for a given tid to receive
    /// the data region into.
    pub fn with_tid(mut self, tid: u64) -> Self {
        self.header.tid = tid;
        self
    }

    pub fn with_version(mut self, version: u16, compat_version: u16) -> Self {
        self.header.version = version;
        self.header.compat_version = compat_version;
        self
    }

    pub(crate) fn from_wire(decoded: DecodedMessage) -> Self {
        Self {
            header: decoded.header,
            footer: decoded.footer,
            front: decoded.front,
            middle: decoded.middle,
            data: decoded.data,
            connection: None,
            recv_stamp: None,
            throttle_permits: Vec::new(),
            dispatch_permit: None,
        }
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    /// Session sequence number; 0 until the message is first written.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn tid(&self) -> u64 {
        self.header.tid
    }

    pub fn priority(&self) -> u16 {
        self.header.priority
    }

    pub fn source(&self) -> EntityName {
        self.header.src
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn footer(&self) -> &MessageFooter {
        &self.footer
    }

    pub fn front(&self) -> &Bytes {
        &self.front
    }

    pub fn middle(&self) -> &Bytes {
        &self.middle
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Connection the message arrived on (or will be written to).
    pub fn connection(&self) -> Option<&ConnectionRef> {
        self.connection.as_ref()
    }

    pub fn recv_stamp(&self) -> Option<Instant> {
        self.recv_stamp
    }

    /// Payload size, used as the scheduling and throttling cost.
    pub fn cost(&self) -> u64 {
        (self.front.len() + self.middle.len() + self.data.len()) as u64
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.header.seq = seq;
    }

    pub(crate) fn set_source(&mut self, src: EntityName) {
        self.header.src = src;
    }

    pub(crate) fn set_connection(&mut self, con: ConnectionRef) {
        self.connection = Some(con);
    }

    pub(crate) fn set_recv_stamp(&mut self, at: Instant) {
        self.recv_stamp = Some(at);
    }

    pub(crate) fn add_throttle_permit(&mut self, permit: ThrottlePermit) {
        self.throttle_permits.push(permit);
    }

    pub(crate) fn set_dispatch_permit(&mut self, permit: ThrottlePermit) {
        self.dispatch_permit = Some(permit);
    }

    /// Detach the dispatch budget so it can be released once the
    /// dispatcher returns, independently of the message's lifetime.
    pub(crate) fn take_dispatch_permit(&mut self) -> Option<ThrottlePermit> {
        self.dispatch_permit.take()
    }

    /// Cheap clones of the payload regions for framing.
    pub(crate) fn payload(&self) -> (Bytes, Bytes, Bytes) {
        (self.front.clone(), self.middle.clone(), self.data.clone())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.header.msg_type)
            .field("seq", &self.header.seq)
            .field("tid", &self.header.tid)
            .field("priority", &self.header.priority)
            .field("src", &self.header.src)
            .field("front", &self.front.len())
            .field("middle", &self.middle.len())
            .field("data", &self.data.len())
            .finish()
    }
}
