//! Application-facing connection handle.
//!
//! # Responsibilities
//! - Name a peer independently of the physical stream serving it
//! - Route sends, keepalives and mark-downs to the live socket
//! - Hold negotiated features, keepalive stamps and an application attachment
//! - Cache receive buffers posted by the application
//!
//! A `Connection` outlives socket replacement: when an incoming session
//! replaces an existing one, the new socket adopts the existing connection.
//! Once a connection is cleared from its last socket it is marked failed and
//! further sends are dropped; the application learns this through
//! `ms_handle_reset` and asks the messenger for a fresh connection.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use bytes::BytesMut;

use crate::error::{MessengerError, MessengerResult};
use crate::messenger::core::MessengerCore;
use crate::msg::{EntityAddr, EntityType, Message};
use crate::net::socket::Socket;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection. Also the class key under which its
/// inbound messages are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shared handle to a connection.
pub type ConnectionRef = Arc<Connection>;

/// Opaque application data attached to a connection.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// What a connection currently points at.
pub(crate) enum Link {
    /// Cleared from its socket; sends are dropped.
    Failed,
    /// No socket yet.
    Detached,
    Socket(Arc<Socket>),
}

#[derive(Default)]
struct SocketLink {
    socket: Option<Arc<Socket>>,
    failed: bool,
}

#[derive(Clone, Copy)]
struct Peer {
    addr: EntityAddr,
    ty: Option<EntityType>,
}

#[derive(Default, Clone, Copy)]
struct KeepaliveStamps {
    received: Option<SystemTime>,
    acked: Option<SystemTime>,
}

pub struct Connection {
    id: ConnectionId,
    msgr: Weak<MessengerCore>,
    peer: Mutex<Peer>,
    features: AtomicU64,
    loopback: bool,
    link: Mutex<SocketLink>,
    attachment: Mutex<Option<Attachment>>,
    keepalive: Mutex<KeepaliveStamps>,
    rx_buffers: Mutex<HashMap<u64, BytesMut>>,
}

impl Connection {
    pub(crate) fn new(
        msgr: Weak<MessengerCore>,
        peer_addr: EntityAddr,
        peer_type: Option<EntityType>,
        loopback: bool,
    ) -> ConnectionRef {
        Arc::new(Self {
            id: ConnectionId::new(),
            msgr,
            peer: Mutex::new(Peer {
                addr: peer_addr,
                ty: peer_type,
            }),
            features: AtomicU64::new(0),
            loopback,
            link: Mutex::new(SocketLink::default()),
            attachment: Mutex::new(None),
            keepalive: Mutex::new(KeepaliveStamps::default()),
            rx_buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> EntityAddr {
        self.peer.lock().expect("connection peer mutex poisoned").addr
    }

    /// Peer entity type; unknown until an accepted session completes its
    /// handshake.
    pub fn peer_type(&self) -> Option<EntityType> {
        self.peer.lock().expect("connection peer mutex poisoned").ty
    }

    pub(crate) fn set_peer(&self, addr: EntityAddr, ty: EntityType) {
        let mut peer = self.peer.lock().expect("connection peer mutex poisoned");
        peer.addr = addr;
        peer.ty = Some(ty);
    }

    /// Feature bits negotiated with the peer.
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Acquire)
    }

    pub fn has_feature(&self, feature: u64) -> bool {
        self.features() & feature == feature
    }

    pub(crate) fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Release);
    }

    /// True for the messenger's connection to itself.
    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    /// Whether a socket currently serves this connection.
    pub fn is_connected(&self) -> bool {
        self.lock_link().socket.is_some()
    }

    /// Whether the session ended and sends are being dropped.
    pub fn is_failed(&self) -> bool {
        self.lock_link().failed
    }

    /// Queue a message for the peer.
    ///
    /// Sending on a failed lossy connection silently drops the message.
    pub fn send_message(self: &Arc<Self>, m: Message) -> MessengerResult<()> {
        let msgr = self.messenger()?;
        msgr.send_on_connection(self, m)
    }

    /// Ask the peer to prove liveness. The reply timestamp is visible via
    /// [`Connection::last_keepalive_ack`] when both sides speak keepalive2.
    pub fn send_keepalive(self: &Arc<Self>) -> MessengerResult<()> {
        let msgr = self.messenger()?;
        msgr.send_keepalive(self);
        Ok(())
    }

    /// Close the session without generating a reset event.
    pub fn mark_down(self: &Arc<Self>) {
        if let Ok(msgr) = self.messenger() {
            msgr.mark_down_connection(self);
        }
    }

    /// Switch the session to lossy: a later fault closes it instead of
    /// reconnecting.
    pub fn mark_disposable(&self) {
        if let Link::Socket(s) = self.try_get_socket() {
            s.mark_disposable();
        }
    }

    pub fn set_priv(&self, data: Attachment) {
        *self.attachment.lock().expect("connection attachment mutex poisoned") = Some(data);
    }

    pub fn get_priv(&self) -> Option<Attachment> {
        self.attachment
            .lock()
            .expect("connection attachment mutex poisoned")
            .clone()
    }

    pub fn clear_priv(&self) -> Option<Attachment> {
        self.attachment
            .lock()
            .expect("connection attachment mutex poisoned")
            .take()
    }

    /// When the peer last sent a keepalive.
    pub fn last_keepalive(&self) -> Option<SystemTime> {
        self.keepalive.lock().expect("keepalive mutex poisoned").received
    }

    /// Timestamp echoed by the peer's last keepalive2 ack.
    pub fn last_keepalive_ack(&self) -> Option<SystemTime> {
        self.keepalive.lock().expect("keepalive mutex poisoned").acked
    }

    pub(crate) fn set_last_keepalive(&self, at: SystemTime) {
        self.keepalive.lock().expect("keepalive mutex poisoned").received = Some(at);
    }

    pub(crate) fn set_last_keepalive_ack(&self, at: SystemTime) {
        self.keepalive.lock().expect("keepalive mutex poisoned").acked = Some(at);
    }

    /// Offer a buffer to receive the data region of the message with
    /// transaction id `tid`. It is used only if large enough.
    pub fn post_rx_buffer(&self, tid: u64, buf: BytesMut) {
        tracing::trace!(connection_id = %self.id, tid, capacity = buf.capacity(), "posted rx buffer");
        self.rx_buffers
            .lock()
            .expect("rx buffer mutex poisoned")
            .insert(tid, buf);
    }

    pub fn revoke_rx_buffer(&self, tid: u64) -> Option<BytesMut> {
        self.rx_buffers
            .lock()
            .expect("rx buffer mutex poisoned")
            .remove(&tid)
    }

    /// Take the posted buffer for `tid` if it can hold `len` bytes.
    pub(crate) fn take_rx_buffer(&self, tid: u64, len: usize) -> Option<BytesMut> {
        let mut buffers = self.rx_buffers.lock().expect("rx buffer mutex poisoned");
        match buffers.get(&tid) {
            Some(buf) if buf.capacity() >= len => buffers.remove(&tid),
            _ => None,
        }
    }

    fn messenger(&self) -> MessengerResult<Arc<MessengerCore>> {
        self.msgr.upgrade().ok_or(MessengerError::ShuttingDown)
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, SocketLink> {
        self.link.lock().expect("connection link mutex poisoned")
    }

    pub(crate) fn try_get_socket(&self) -> Link {
        let link = self.lock_link();
        if link.failed {
            return Link::Failed;
        }
        match &link.socket {
            Some(s) => Link::Socket(Arc::clone(s)),
            None => Link::Detached,
        }
    }

    /// Point the connection at a new socket.
    pub(crate) fn reset_socket(&self, socket: &Arc<Socket>) {
        let mut link = self.lock_link();
        link.socket = Some(Arc::clone(socket));
    }

    /// Detach from `socket` if it is still the current one. The first
    /// successful clear marks the connection failed; callers queue the reset
    /// event only when this returns true, so it is delivered at most once.
    pub(crate) fn clear_socket(&self, socket: &Socket) -> bool {
        let mut link = self.lock_link();
        match &link.socket {
            Some(cur) if std::ptr::eq(Arc::as_ptr(cur), socket) => {
                link.socket = None;
                link.failed = true;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer_addr())
            .field("loopback", &self.loopback)
            .finish()
    }
}
