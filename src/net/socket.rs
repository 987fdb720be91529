//! One physical session with a peer.
//!
//! # Responsibilities
//! - Hold the session state machine and sequence counters
//! - Own the outbound priority queues, the requeue list and the sent list
//! - Route faults into reconnect, standby or close
//! - Track its tasks so the reaper can collect it once they exit
//!
//! # State Transitions
//! ```text
//! Connecting → Open            handshake success (writer)
//! Accepting  → Open            handshake success (accept task)
//! Open       → Connecting      recoverable fault, not server
//! Open       → Standby         recoverable fault, server or nothing queued
//! Standby    → Connecting      something queued, not server
//! Connecting → Wait            lost a connect race
//! Wait       → Connecting      not replaced before the wait timeout
//! Closing    → Closed          close acknowledged
//! any        → Closed          local stop or lossy fault
//! ```
//!
//! # Design Decisions
//! - All state lives behind one `std::sync::Mutex`; no guard is held across
//!   an await
//! - Lock order is registry, then socket, then connection
//! - `out_seq` never decreases within a session: resent messages keep the
//!   sequence number they were first written with

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::messenger::core::MessengerCore;
use crate::messenger::policy::Policy;
use crate::msg::{EntityAddr, EntityType, Message};
use crate::net::accepter::AcceptPermit;
use crate::net::connection::ConnectionRef;
use crate::net::delayed::DelayedDelivery;
use crate::net::stream::{StreamCtl, StreamReader, StreamWriter};
use crate::net::{reader, writer};
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Accepting,
    Connecting,
    Open,
    Standby,
    Closing,
    Closed,
    Wait,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Accepting => "accepting",
            State::Connecting => "connecting",
            State::Open => "open",
            State::Standby => "standby",
            State::Closing => "closing",
            State::Closed => "closed",
            State::Wait => "wait",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which task observed a fault, and on which stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FaultOrigin {
    Reader(u64),
    /// `None` while the writer is handshaking on a stream not yet installed.
    Writer(Option<u64>),
}

/// Point-in-time view of one socket.
#[derive(Debug, Clone, Serialize)]
pub struct SocketStatus {
    pub id: u64,
    pub peer: String,
    pub peer_type: Option<EntityType>,
    pub state: State,
    pub lossy: bool,
    pub connect_seq: u32,
    pub peer_global_seq: u32,
    pub out_seq: u64,
    pub in_seq: u64,
    pub in_seq_acked: u64,
    pub queued: usize,
    pub requeued: usize,
    pub sent: usize,
}

pub(crate) struct SocketInner {
    pub(crate) state: State,
    pub(crate) peer_addr: EntityAddr,
    pub(crate) peer_type: Option<EntityType>,
    pub(crate) policy: Policy,
    pub(crate) connection: ConnectionRef,
    pub(crate) out_q: BTreeMap<u16, VecDeque<Message>>,
    /// Messages written once and not acknowledged, to be resent first.
    pub(crate) requeue: VecDeque<Message>,
    pub(crate) sent: VecDeque<Message>,
    pub(crate) out_seq: u64,
    pub(crate) in_seq: u64,
    pub(crate) in_seq_acked: u64,
    pub(crate) connect_seq: u32,
    pub(crate) peer_global_seq: u32,
    /// Global sequence of our latest outgoing connect attempt.
    pub(crate) attempt_gseq: u32,
    /// The peer lost its session state; the next replace restarts `in_seq`.
    pub(crate) peer_reset_pending: bool,
    pub(crate) backoff: Backoff,
    pub(crate) keepalive: bool,
    pub(crate) keepalive_ack: Option<SystemTime>,
    pub(crate) wait_deadline: Option<Instant>,
    pub(crate) reader_dispatching: bool,
    pub(crate) delay: Option<Arc<DelayedDelivery>>,
    stream: Option<StreamCtl>,
    active_readers: usize,
    writer_running: bool,
    reap_queued: bool,
    tasks: Vec<JoinHandle<()>>,
    accept_permit: Option<AcceptPermit>,
}

impl SocketInner {
    pub(crate) fn is_queued(&self) -> bool {
        !self.out_q.is_empty() || !self.requeue.is_empty() || self.keepalive
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.out_q.values().map(VecDeque::len).sum()
    }

    pub(crate) fn is_current_stream(&self, gen: u64) -> bool {
        self.stream.as_ref().is_some_and(|s| s.gen == gen)
    }

    pub(crate) fn enqueue_out(&mut self, m: Message) {
        self.out_q.entry(m.priority()).or_default().push_back(m);
    }

    /// Next message to write: resends first, then the highest priority.
    pub(crate) fn next_outgoing(&mut self) -> Option<Message> {
        if let Some(m) = self.requeue.pop_front() {
            return Some(m);
        }
        let mut entry = self.out_q.last_entry()?;
        let m = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        m
    }

    /// Move unacknowledged messages back in front of the resend list.
    pub(crate) fn requeue_sent(&mut self) {
        while let Some(m) = self.sent.pop_back() {
            tracing::trace!(seq = m.seq(), "requeue sent message");
            self.requeue.push_front(m);
        }
    }

    /// Drop resends the peer already has.
    pub(crate) fn discard_requeued_up_to(&mut self, seq: u64) {
        while self.requeue.front().is_some_and(|m| m.seq() <= seq) {
            self.requeue.pop_front();
        }
    }

    pub(crate) fn discard_out_queue(&mut self) {
        let dropped = self.sent.len() + self.requeue.len() + self.queued_len();
        self.sent.clear();
        self.requeue.clear();
        self.out_q.clear();
        if dropped > 0 {
            tracing::debug!(peer = %self.peer_addr, dropped, "discarded outgoing messages");
        }
    }

    /// Retire everything the peer acknowledged.
    pub(crate) fn handle_ack(&mut self, seq: u64) {
        while self.sent.front().is_some_and(|m| m.seq() <= seq) {
            self.sent.pop_front();
        }
    }

    /// Take over another socket's outgoing state: its resends go first and
    /// its queued messages are placed ahead of ours at each priority.
    pub(crate) fn adopt_outgoing(&mut self, other: &mut SocketInner) {
        other.requeue_sent();
        self.requeue = std::mem::take(&mut other.requeue);
        self.out_seq = other.out_seq;
        for (prio, mut theirs) in std::mem::take(&mut other.out_q) {
            let ours = self.out_q.entry(prio).or_default();
            theirs.append(ours);
            *ours = theirs;
        }
    }
}

pub(crate) struct Socket {
    id: u64,
    pub(crate) msgr: Arc<MessengerCore>,
    inner: Mutex<SocketInner>,
    pub(crate) writer_wake: Notify,
    pub(crate) dispatch_done: Notify,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Socket {
    pub(crate) fn new(
        msgr: Arc<MessengerCore>,
        state: State,
        peer_addr: EntityAddr,
        peer_type: Option<EntityType>,
        policy: Policy,
        connection: ConnectionRef,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            msgr,
            inner: Mutex::new(SocketInner {
                state,
                peer_addr,
                peer_type,
                policy,
                connection,
                out_q: BTreeMap::new(),
                requeue: VecDeque::new(),
                sent: VecDeque::new(),
                out_seq: 0,
                in_seq: 0,
                in_seq_acked: 0,
                connect_seq: 0,
                peer_global_seq: 0,
                attempt_gseq: 0,
                peer_reset_pending: false,
                backoff: Backoff::default(),
                keepalive: false,
                keepalive_ack: None,
                wait_deadline: None,
                reader_dispatching: false,
                delay: None,
                stream: None,
                // the accept task counts as the first reader
                active_readers: usize::from(state == State::Accepting),
                writer_running: false,
                reap_queued: false,
                tasks: Vec::new(),
                accept_permit: None,
            }),
            writer_wake: Notify::new(),
            dispatch_done: Notify::new(),
            stop_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().expect("socket mutex poisoned")
    }

    /// Set once the socket is stopped; registry lookups skip closed sockets.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn set_accept_permit(&self, permit: AcceptPermit) {
        self.lock().accept_permit = Some(permit);
    }

    pub(crate) fn add_task(&self, task: JoinHandle<()>) {
        self.lock().tasks.push(task);
    }

    pub(crate) fn shutdown_stream_locked(&self, inner: &mut SocketInner) {
        if let Some(ctl) = inner.stream.take() {
            tracing::trace!(socket = self.id, gen = ctl.gen, "shutting down stream");
            ctl.shutdown();
        }
        self.writer_wake.notify_one();
    }

    pub(crate) fn install_stream_locked(&self, inner: &mut SocketInner, ctl: StreamCtl) {
        self.shutdown_stream_locked(inner);
        inner.stream = Some(ctl);
    }

    /// Enter `Closed` without touching the stream, so a final `CLOSE` can
    /// still be written.
    pub(crate) fn mark_closed_locked(&self, inner: &mut SocketInner) {
        inner.state = State::Closed;
        self.closed.store(true, Ordering::Release);
        self.stop_tx.send_replace(true);
        self.writer_wake.notify_one();
    }

    /// Idempotent local stop.
    pub(crate) fn stop_locked(&self, inner: &mut SocketInner) {
        if inner.state != State::Closed {
            tracing::debug!(socket = self.id, peer = %inner.peer_addr, state = %inner.state, "stop");
        }
        self.mark_closed_locked(inner);
        self.shutdown_stream_locked(inner);
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.lock();
        self.stop_locked(&mut inner);
    }

    pub(crate) fn send_locked(&self, inner: &mut SocketInner, m: Message) {
        tracing::trace!(
            socket = self.id,
            peer = %inner.peer_addr,
            msg_type = m.msg_type(),
            priority = m.priority(),
            "queue message"
        );
        inner.enqueue_out(m);
        self.writer_wake.notify_one();
    }

    pub(crate) fn send_keepalive_locked(&self, inner: &mut SocketInner) {
        inner.keepalive = true;
        self.writer_wake.notify_one();
    }

    /// The wait after a lost race is over without a replacement arriving.
    pub(crate) fn wait_expired(&self) {
        let mut inner = self.lock();
        if inner.state == State::Wait {
            tracing::debug!(socket = self.id, peer = %inner.peer_addr, "wait expired, reconnecting");
            inner.state = State::Connecting;
            inner.wait_deadline = None;
        }
    }

    pub(crate) fn mark_disposable(&self) {
        let mut inner = self.lock();
        tracing::debug!(socket = self.id, peer = %inner.peer_addr, "marked disposable");
        inner.policy.lossy = true;
    }

    /// The peer told us our session no longer exists: drop everything
    /// queued in both directions and start over from zero.
    pub(crate) fn was_session_reset_locked(&self, inner: &mut SocketInner) {
        tracing::info!(socket = self.id, peer = %inner.peer_addr, "session reset");
        let con = Arc::clone(&inner.connection);
        self.msgr.dispatch().discard_queue(con.id());
        if let Some(delay) = &inner.delay {
            delay.discard();
        }
        inner.discard_out_queue();
        self.msgr.dispatch().queue_remote_reset(&con);
        inner.out_seq = 0;
        inner.in_seq = 0;
        inner.in_seq_acked = 0;
        inner.connect_seq = 0;
        inner.peer_reset_pending = false;
    }

    /// Start delayed delivery for this socket if injection targets its
    /// peer type.
    pub(crate) fn maybe_start_delay_locked(&self, inner: &mut SocketInner) {
        if inner.delay.is_some() {
            return;
        }
        let Some(ty) = inner.peer_type else {
            return;
        };
        let config = self.msgr.config();
        let inject = &config.inject;
        if inject.delay_max_ms == 0 || !inject.delay_types.iter().any(|t| t == ty.as_str()) {
            return;
        }
        tracing::info!(socket = self.id, peer = %inner.peer_addr, "delayed delivery enabled");
        inner.delay = Some(DelayedDelivery::start(Arc::clone(self.msgr.dispatch())));
    }

    pub(crate) fn spawn_writer_locked(
        self: &Arc<Self>,
        inner: &mut SocketInner,
        stream: Option<StreamWriter>,
    ) {
        inner.writer_running = true;
        let task = tokio::spawn(writer::run(Arc::clone(self), stream));
        inner.tasks.push(task);
    }

    pub(crate) fn spawn_reader_locked(self: &Arc<Self>, inner: &mut SocketInner, rd: StreamReader) {
        inner.active_readers += 1;
        let task = tokio::spawn(reader::run(Arc::clone(self), rd));
        inner.tasks.push(task);
    }

    /// React to a failed stream. Returns how long the writer should wait
    /// before its next connect attempt.
    pub(crate) fn fault(self: &Arc<Self>, origin: FaultOrigin) -> Option<Duration> {
        let mut inner = self.lock();

        if matches!(origin, FaultOrigin::Reader(_)) && inner.state == State::Connecting {
            tracing::debug!(socket = self.id, "fault while already connecting, reader exiting");
            return None;
        }

        if matches!(inner.state, State::Closed | State::Closing) {
            self.shutdown_stream_locked(&mut inner);
            let con = Arc::clone(&inner.connection);
            drop(inner);
            if con.clear_socket(self) {
                self.msgr.dispatch().queue_reset(&con);
            }
            return None;
        }

        let gen = match origin {
            FaultOrigin::Reader(gen) | FaultOrigin::Writer(Some(gen)) => Some(gen),
            FaultOrigin::Writer(None) => None,
        };
        if let Some(gen) = gen {
            if !inner.is_current_stream(gen) {
                tracing::trace!(socket = self.id, gen, "fault on stale stream ignored");
                return None;
            }
        }

        self.shutdown_stream_locked(&mut inner);
        metrics::record_socket_fault(inner.policy.lossy);

        if inner.policy.lossy && inner.state != State::Connecting {
            tracing::info!(socket = self.id, peer = %inner.peer_addr, "fault on lossy channel, failing");
            self.stop_locked(&mut inner);
            let con = Arc::clone(&inner.connection);
            let cleared = con.clear_socket(self);
            let peer = inner.peer_addr;
            let delay = inner.delay.clone();
            drop(inner);

            self.msgr.unregister_socket(&peer, self);

            if let Some(delay) = delay {
                delay.discard();
            }
            self.msgr.dispatch().discard_queue(con.id());
            self.lock().discard_out_queue();
            if cleared {
                self.msgr.dispatch().queue_reset(&con);
            }
            return None;
        }

        if let Some(delay) = &inner.delay {
            delay.flush();
        }
        inner.requeue_sent();

        if inner.policy.standby && !inner.is_queued() {
            tracing::info!(socket = self.id, peer = %inner.peer_addr, "fault with nothing to send, going to standby");
            inner.state = State::Standby;
            return None;
        }

        if inner.state != State::Connecting {
            if inner.policy.server {
                tracing::info!(socket = self.id, peer = %inner.peer_addr, "fault, server, going to standby");
                inner.state = State::Standby;
            } else {
                tracing::info!(socket = self.id, peer = %inner.peer_addr, "fault, initiating reconnect");
                inner.connect_seq += 1;
                inner.state = State::Connecting;
            }
            inner.backoff.reset();
            None
        } else {
            let config = self.msgr.config();
            let delay = inner
                .backoff
                .next_delay(config.backoff.initial_ms, config.backoff.max_ms);
            tracing::debug!(
                socket = self.id,
                peer = %inner.peer_addr,
                attempt = inner.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "fault while connecting, backing off"
            );
            Some(delay)
        }
    }

    pub(crate) fn reader_exited(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.active_readers = inner.active_readers.saturating_sub(1);
        self.maybe_queue_reap_locked(&mut inner);
    }

    pub(crate) fn writer_exited(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.writer_running = false;
        self.maybe_queue_reap_locked(&mut inner);
    }

    fn maybe_queue_reap_locked(self: &Arc<Self>, inner: &mut SocketInner) {
        if inner.state == State::Closed
            && inner.active_readers == 0
            && !inner.writer_running
            && !inner.reap_queued
        {
            inner.reap_queued = true;
            tracing::debug!(socket = self.id, peer = %inner.peer_addr, "queue for reaping");
            self.msgr.queue_reap(Arc::clone(self));
        }
    }

    /// Release everything the reaper must drop or join outside the lock.
    pub(crate) fn take_for_reap(
        &self,
        inner: &mut SocketInner,
    ) -> (Vec<JoinHandle<()>>, Option<Arc<DelayedDelivery>>, Option<AcceptPermit>) {
        inner.discard_out_queue();
        (
            std::mem::take(&mut inner.tasks),
            inner.delay.take(),
            inner.accept_permit.take(),
        )
    }

    pub(crate) fn status(&self) -> SocketStatus {
        let inner = self.lock();
        SocketStatus {
            id: self.id,
            peer: inner.peer_addr.to_string(),
            peer_type: inner.peer_type,
            state: inner.state,
            lossy: inner.policy.lossy,
            connect_seq: inner.connect_seq,
            peer_global_seq: inner.peer_global_seq,
            out_seq: inner.out_seq,
            in_seq: inner.in_seq,
            in_seq_acked: inner.in_seq_acked,
            queued: inner.queued_len(),
            requeued: inner.requeue.len(),
            sent: inner.sent.len(),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessengerConfig;
    use crate::dispatch::{Delivery, Dispatcher};
    use crate::msg::{EntityName, PRIO_HIGH, PRIO_LOW};
    use crate::net::connection::{Connection, Link};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Resets {
        resets: AtomicUsize,
        remote_resets: AtomicUsize,
    }

    impl Dispatcher for Resets {
        fn ms_dispatch(&self, _m: Message) -> Delivery {
            Delivery::Handled
        }

        fn ms_handle_reset(&self, _con: &ConnectionRef) -> bool {
            self.resets.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn ms_handle_remote_reset(&self, _con: &ConnectionRef) {
            self.remote_resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer() -> EntityAddr {
        "127.0.0.1:6801/9".parse().unwrap()
    }

    fn open_socket(msgr: &Arc<MessengerCore>, policy: Policy) -> Arc<Socket> {
        let con = Connection::new(Arc::downgrade(msgr), peer(), Some(EntityType::Osd), false);
        let socket = Socket::new(
            Arc::clone(msgr),
            State::Open,
            peer(),
            Some(EntityType::Osd),
            policy,
            Arc::clone(&con),
        );
        con.reset_socket(&socket);
        msgr.register_socket(&socket);
        socket
    }

    fn with_seq(t: u16, seq: u64) -> Message {
        let mut m = Message::new(t);
        m.set_seq(seq);
        m
    }

    #[tokio::test]
    async fn lossy_fault_closes_and_resets_once() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let rec = Arc::new(Resets::default());
        msgr.dispatch().dispatchers().add_tail(rec.clone());

        let socket = open_socket(&msgr, Policy::lossy_client());
        {
            let mut inner = socket.lock();
            for t in 0..5 {
                socket.send_locked(&mut inner, Message::new(t));
            }
            assert_eq!(inner.queued_len(), 5);
        }

        assert_eq!(socket.fault(FaultOrigin::Writer(None)), None);
        // a second fault on the now closed socket must not reset again
        assert_eq!(socket.fault(FaultOrigin::Writer(None)), None);

        {
            let inner = socket.lock();
            assert_eq!(inner.state, State::Closed);
            assert!(!inner.is_queued());
            assert!(inner.sent.is_empty());
            assert!(matches!(inner.connection.try_get_socket(), Link::Failed));
        }
        assert!(socket.is_closed());
        assert!(msgr.lookup(&peer()).is_none());

        msgr.dispatch().start();
        msgr.dispatch().shutdown();
        msgr.dispatch().wait().await;
        assert_eq!(rec.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lossless_fault_requeues_and_reconnects() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let socket = open_socket(&msgr, Policy::lossless_client());
        {
            let mut inner = socket.lock();
            inner.connect_seq = 1;
            inner.out_seq = 3;
            for seq in 1..=3 {
                inner.sent.push_back(with_seq(1, seq));
            }
            socket.send_locked(&mut inner, Message::new(2));
        }

        assert_eq!(socket.fault(FaultOrigin::Writer(None)), None);
        let inner = socket.lock();
        assert_eq!(inner.state, State::Connecting);
        assert_eq!(inner.connect_seq, 2);
        assert!(inner.sent.is_empty());
        let seqs: Vec<u64> = inner.requeue.iter().map(Message::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(inner.out_seq, 3);
        assert_eq!(inner.queued_len(), 1);
    }

    #[tokio::test]
    async fn fault_while_connecting_backs_off() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let socket = open_socket(&msgr, Policy::lossless_client());
        socket.lock().state = State::Connecting;
        let first = socket.fault(FaultOrigin::Writer(None)).unwrap();
        let second = socket.fault(FaultOrigin::Writer(None)).unwrap();
        assert!(first >= Duration::from_millis(200));
        assert!(second >= Duration::from_millis(400));
        // a reader fault while connecting is ignored
        assert_eq!(socket.fault(FaultOrigin::Reader(1)), None);
        assert_eq!(socket.lock().backoff.attempt(), 2);
    }

    #[tokio::test]
    async fn standby_when_idle() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let socket = open_socket(&msgr, Policy::lossless_peer());
        assert_eq!(socket.fault(FaultOrigin::Writer(None)), None);
        assert_eq!(socket.lock().state, State::Standby);

        let server = open_socket(&msgr, Policy::stateful_server());
        server.lock().sent.push_back(with_seq(1, 1));
        server.fault(FaultOrigin::Writer(None));
        assert_eq!(server.lock().state, State::Standby);
        assert_eq!(server.lock().requeue.len(), 1);
    }

    #[tokio::test]
    async fn session_reset_zeroes_sequences() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let rec = Arc::new(Resets::default());
        msgr.dispatch().dispatchers().add_tail(rec.clone());
        let socket = open_socket(&msgr, Policy::default());
        {
            let mut inner = socket.lock();
            inner.out_seq = 10;
            inner.in_seq = 7;
            inner.connect_seq = 4;
            inner.sent.push_back(with_seq(1, 10));
            socket.send_locked(&mut inner, Message::new(1));
            socket.was_session_reset_locked(&mut inner);
            assert_eq!((inner.out_seq, inner.in_seq, inner.connect_seq), (0, 0, 0));
            assert!(!inner.is_queued() && inner.sent.is_empty());
        }
        msgr.dispatch().start();
        msgr.dispatch().shutdown();
        msgr.dispatch().wait().await;
        assert_eq!(rec.remote_resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outgoing_order_and_acks() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let socket = open_socket(&msgr, Policy::default());
        let mut inner = socket.lock();
        inner.enqueue_out(Message::new(1).with_priority(PRIO_LOW));
        inner.enqueue_out(Message::new(2).with_priority(PRIO_HIGH));
        inner.requeue.push_back(with_seq(3, 5));

        let order: Vec<u16> = std::iter::from_fn(|| inner.next_outgoing())
            .map(|m| m.msg_type())
            .collect();
        assert_eq!(order, vec![3, 2, 1]);

        for seq in 1..=4 {
            inner.sent.push_back(with_seq(0, seq));
        }
        inner.handle_ack(2);
        assert_eq!(inner.sent.front().map(Message::seq), Some(3));

        inner.requeue_sent();
        inner.discard_requeued_up_to(3);
        assert_eq!(inner.requeue.iter().map(Message::seq).collect::<Vec<_>>(), vec![4]);
    }

    #[tokio::test]
    async fn adopt_outgoing_puts_existing_first() {
        let msgr = MessengerCore::new(EntityName::osd(0), MessengerConfig::default());
        let old = open_socket(&msgr, Policy::default());
        let new = open_socket(&msgr, Policy::default());
        let mut old_inner = old.lock();
        let mut new_inner = new.lock();
        old_inner.out_seq = 9;
        old_inner.sent.push_back(with_seq(1, 8));
        old_inner.sent.push_back(with_seq(2, 9));
        old_inner.enqueue_out(Message::new(3));
        new_inner.enqueue_out(Message::new(4));

        new_inner.adopt_outgoing(&mut old_inner);
        assert_eq!(new_inner.out_seq, 9);
        let order: Vec<u16> = std::iter::from_fn(|| new_inner.next_outgoing())
            .map(|m| m.msg_type())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(!old_inner.is_queued());
    }
}
