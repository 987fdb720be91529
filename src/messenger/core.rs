//! Shared messenger state: identity, registry of sockets, dispatch queue
//! and the reaper.
//!
//! # Responsibilities
//! - Route outgoing messages to an existing socket, loopback, or a new
//!   connecting socket
//! - Keep the address-keyed registry used by handshakes to find the
//!   existing session with a peer
//! - Hand out the process-wide global sequence
//! - Tear down closed sockets once their tasks exit
//!
//! Lock order: registry, then socket, then connection link. The global
//! sequence mutex and the dispatch queue lock are leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::MessengerConfig;
use crate::dispatch::{DispatchQueue, Dispatchers};
use crate::error::{MessengerError, MessengerResult};
use crate::lifecycle::Shutdown;
use crate::messenger::policy::{Policy, PolicyTable};
use crate::msg::{EntityAddr, EntityInst, EntityName, EntityType, Message};
use crate::net::accepter::{AcceptPermit, Accepter, AccepterError};
use crate::net::connection::{Connection, ConnectionRef, Link};
use crate::net::handshake;
use crate::net::socket::{Socket, SocketStatus, State};
use crate::observability::metrics;

const REAP_POLL: Duration = Duration::from_millis(100);

/// Every live socket, indexed the ways handshakes and teardown need.
#[derive(Default)]
pub(crate) struct Registry {
    /// Sessions by peer address; at most one per peer.
    pub(crate) rank: HashMap<EntityAddr, Arc<Socket>>,
    /// Incoming sockets still negotiating.
    pub(crate) accepting: HashMap<u64, Arc<Socket>>,
    /// Every socket not yet reaped.
    pub(crate) sockets: HashMap<u64, Arc<Socket>>,
    pub(crate) stopping: bool,
}

impl Registry {
    /// The open session for `addr`, skipping one already stopped.
    pub(crate) fn lookup(&self, addr: &EntityAddr) -> Option<Arc<Socket>> {
        self.rank.get(addr).filter(|s| !s.is_closed()).cloned()
    }

    pub(crate) fn register_rank(&mut self, addr: EntityAddr, socket: &Arc<Socket>) {
        self.sockets.insert(socket.id(), Arc::clone(socket));
        if let Some(old) = self.rank.insert(addr, Arc::clone(socket)) {
            if !Arc::ptr_eq(&old, socket) {
                tracing::trace!(peer = %addr, old = old.id(), new = socket.id(), "rank entry replaced");
            }
        }
    }

    /// Remove `socket` from the rank map if it is still the entry for `addr`.
    pub(crate) fn unregister(&mut self, addr: &EntityAddr, socket: &Socket) {
        let current = self
            .rank
            .get(addr)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), socket));
        if current {
            self.rank.remove(addr);
        }
    }
}

/// Snapshot of a messenger for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MessengerStatus {
    pub name: EntityName,
    pub addr: String,
    pub stopping: bool,
    pub dispatch_queue_len: usize,
    pub dispatch_throttle_current: u64,
    pub dispatch_throttle_max: u64,
    pub accepting: usize,
    pub sockets: Vec<SocketStatus>,
}

pub struct MessengerCore {
    my_name: ArcSwap<EntityName>,
    my_addr: ArcSwap<EntityAddr>,
    config: ArcSwap<MessengerConfig>,
    policies: PolicyTable,
    registry: Mutex<Registry>,
    dispatch: Arc<DispatchQueue>,
    global_seq: Mutex<u32>,
    loopback: ConnectionRef,
    reap_tx: mpsc::UnboundedSender<Arc<Socket>>,
    reap_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Socket>>>>,
    reaped: Notify,
    reaper_stop: Notify,
    shutdown: Shutdown,
    accepter: Mutex<Option<Accepter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MessengerCore {
    pub(crate) fn new(name: EntityName, config: MessengerConfig) -> Arc<Self> {
        let nonce = match config.identity.nonce {
            0 => fastrand::u32(1..),
            n => n,
        };
        let my_addr = EntityAddr::blank(nonce);
        let dispatch = Arc::new(DispatchQueue::new(
            Arc::new(Dispatchers::new()),
            &config.dispatch,
        ));
        let policies = PolicyTable::from_config(&config);
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak| Self {
            my_name: ArcSwap::from_pointee(name),
            my_addr: ArcSwap::from_pointee(my_addr),
            config: ArcSwap::from_pointee(config),
            policies,
            registry: Mutex::new(Registry::default()),
            dispatch,
            global_seq: Mutex::new(0),
            loopback: Connection::new(weak.clone(), my_addr, Some(name.ty), true),
            reap_tx,
            reap_rx: Mutex::new(Some(reap_rx)),
            reaped: Notify::new(),
            reaper_stop: Notify::new(),
            shutdown: Shutdown::new(),
            accepter: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            reaper: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub(crate) fn config(&self) -> Arc<MessengerConfig> {
        self.config.load_full()
    }

    pub(crate) fn my_name(&self) -> EntityName {
        **self.my_name.load()
    }

    pub(crate) fn set_my_name(&self, name: EntityName) {
        self.my_name.store(Arc::new(name));
    }

    pub(crate) fn my_addr(&self) -> EntityAddr {
        **self.my_addr.load()
    }

    pub(crate) fn dispatch(&self) -> &Arc<DispatchQueue> {
        &self.dispatch
    }

    pub(crate) fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub(crate) fn loopback(&self) -> &ConnectionRef {
        &self.loopback
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry mutex poisoned")
    }

    /// Next global sequence, never below `old`.
    pub(crate) fn get_global_seq(&self, old: u32) -> u32 {
        let mut g = self.global_seq.lock().expect("global seq mutex poisoned");
        if old > *g {
            *g = old;
        }
        *g += 1;
        *g
    }

    /// Adopt the IP a peer sees us as, if we do not know our own yet.
    pub(crate) fn learned_addr(&self, addr_for_me: &EntityAddr) {
        let _reg = self.lock_registry();
        let mut mine = self.my_addr();
        if !mine.is_blank_ip() {
            return;
        }
        mine.set_ip(addr_for_me.ip());
        self.my_addr.store(Arc::new(mine));
        self.loopback.set_peer(mine, self.my_name().ty);
        tracing::info!(addr = %mine, "learned my address");
    }

    pub(crate) async fn bind(&self, addr: SocketAddr) -> MessengerResult<EntityAddr> {
        if self.started.load(Ordering::Acquire) {
            return Err(MessengerError::AlreadyBound);
        }
        let config = self.config();
        let accepter = Accepter::bind(addr, &config.listener)
            .await
            .map_err(|e| match e {
                AccepterError::Bind(source) => MessengerError::Bind {
                    addr: addr.to_string(),
                    source,
                },
                other => MessengerError::Io(std::io::Error::other(other.to_string())),
            })?;
        let local = accepter.local_addr()?;
        let my_addr = EntityAddr::new(local, self.my_addr().nonce);
        self.my_addr.store(Arc::new(my_addr));
        self.loopback.set_peer(my_addr, self.my_name().ty);
        *self.accepter.lock().expect("accepter mutex poisoned") = Some(accepter);
        Ok(my_addr)
    }

    pub(crate) fn start(self: &Arc<Self>) -> MessengerResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(MessengerError::AlreadyStarted);
        }
        self.dispatch.start();

        if let Some(rx) = self.reap_rx.lock().expect("reaper mutex poisoned").take() {
            let reaper = tokio::spawn(Arc::clone(self).run_reaper(rx));
            *self.reaper.lock().expect("reaper mutex poisoned") = Some(reaper);
        }

        let accepter = self.accepter.lock().expect("accepter mutex poisoned").take();
        if let Some(accepter) = accepter {
            let task = tokio::spawn(accepter.run(Arc::clone(self), self.shutdown.subscribe()));
            self.tasks.lock().expect("task list mutex poisoned").push(task);
        }
        tracing::info!(name = %self.my_name(), addr = %self.my_addr(), "messenger started");
        Ok(())
    }

    /// Register a freshly accepted stream and start negotiating on it.
    pub(crate) fn add_accept(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        permit: AcceptPermit,
    ) {
        let mut reg = self.lock_registry();
        if reg.stopping {
            tracing::debug!(remote = %remote, "stopping, dropping accepted stream");
            return;
        }
        let addr = EntityAddr::new(remote, 0);
        let con = Connection::new(Arc::downgrade(self), addr, None, false);
        let socket = Socket::new(
            Arc::clone(self),
            State::Accepting,
            addr,
            None,
            self.policies.default_policy(),
            con,
        );
        socket.set_accept_permit(permit);
        reg.accepting.insert(socket.id(), Arc::clone(&socket));
        reg.sockets.insert(socket.id(), Arc::clone(&socket));
        metrics::set_active_sockets(reg.sockets.len());
        let task = tokio::spawn(handshake::accept(Arc::clone(&socket), stream, remote));
        socket.add_task(task);
    }

    /// Create a connecting socket for `addr`, reusing `con` if given.
    fn connect_rank(
        self: &Arc<Self>,
        reg: &mut Registry,
        addr: EntityAddr,
        ty: Option<EntityType>,
        con: Option<ConnectionRef>,
    ) -> Arc<Socket> {
        let policy = self.policy_for(ty);
        let con = con.unwrap_or_else(|| Connection::new(Arc::downgrade(self), addr, ty, false));
        let socket = Socket::new(
            Arc::clone(self),
            State::Connecting,
            addr,
            ty,
            policy,
            Arc::clone(&con),
        );
        con.reset_socket(&socket);
        if let Some(old) = reg.rank.get(&addr) {
            old.stop();
        }
        reg.register_rank(addr, &socket);
        metrics::set_active_sockets(reg.sockets.len());
        {
            let mut inner = socket.lock();
            socket.spawn_writer_locked(&mut inner, None);
        }
        tracing::debug!(socket = socket.id(), peer = %addr, "new connecting socket");
        socket
    }

    fn policy_for(&self, ty: Option<EntityType>) -> Policy {
        match ty {
            Some(ty) => self.policies.get(ty),
            None => self.policies.default_policy(),
        }
    }

    fn submit_message(
        self: &Arc<Self>,
        mut m: Message,
        con: Option<ConnectionRef>,
        dest: EntityAddr,
        dest_type: Option<EntityType>,
    ) {
        if let Some(con) = &con {
            if con.is_loopback() {
                m.set_connection(Arc::clone(&self.loopback));
                self.dispatch.local_delivery(m);
                return;
            }
            let mut link = con.try_get_socket();
            loop {
                match link {
                    Link::Failed => {
                        tracing::debug!(peer = %dest, "failed lossy connection, dropping message");
                        return;
                    }
                    Link::Detached => break,
                    Link::Socket(socket) => {
                        let mut inner = socket.lock();
                        if inner.state != State::Closed {
                            socket.send_locked(&mut inner, m);
                            return;
                        }
                        drop(inner);
                        link = con.try_get_socket();
                        if let Link::Socket(current) = &link {
                            if Arc::ptr_eq(current, &socket) {
                                tracing::debug!(peer = %dest, "session closed, dropping message");
                                return;
                            }
                        }
                    }
                }
            }
        }

        if dest == self.my_addr() {
            m.set_connection(Arc::clone(&self.loopback));
            self.dispatch.local_delivery(m);
            return;
        }

        if self.policy_for(dest_type).server {
            tracing::debug!(peer = %dest, "server policy toward peer, no session, dropping message");
            return;
        }

        let mut reg = self.lock_registry();
        if reg.stopping {
            return;
        }
        if let Some(socket) = reg.lookup(&dest) {
            let mut inner = socket.lock();
            if inner.state != State::Closed {
                socket.send_locked(&mut inner, m);
                return;
            }
        }
        let socket = self.connect_rank(&mut reg, dest, dest_type, con);
        let mut inner = socket.lock();
        socket.send_locked(&mut inner, m);
    }

    pub(crate) fn send_message(
        self: &Arc<Self>,
        m: Message,
        dest: &EntityInst,
    ) -> MessengerResult<()> {
        if self.is_stopping() {
            return Err(MessengerError::ShuttingDown);
        }
        tracing::trace!(dest = %dest.addr, msg_type = m.msg_type(), "send_message");
        self.submit_message(m, None, dest.addr, Some(dest.name.ty));
        Ok(())
    }

    pub(crate) fn send_on_connection(
        self: &Arc<Self>,
        con: &ConnectionRef,
        m: Message,
    ) -> MessengerResult<()> {
        if self.is_stopping() {
            return Err(MessengerError::ShuttingDown);
        }
        self.submit_message(m, Some(Arc::clone(con)), con.peer_addr(), con.peer_type());
        Ok(())
    }

    pub(crate) fn send_keepalive(&self, con: &ConnectionRef) {
        match con.try_get_socket() {
            Link::Socket(socket) => {
                let mut inner = socket.lock();
                socket.send_keepalive_locked(&mut inner);
            }
            _ => tracing::debug!(peer = %con.peer_addr(), "keepalive on connection without a session"),
        }
    }

    /// Connection handle for `dest`, creating a connecting session if none
    /// exists.
    pub(crate) fn get_connection(
        self: &Arc<Self>,
        dest: &EntityInst,
    ) -> MessengerResult<ConnectionRef> {
        if dest.addr == self.my_addr() {
            return Ok(Arc::clone(&self.loopback));
        }
        let mut reg = self.lock_registry();
        if reg.stopping {
            return Err(MessengerError::ShuttingDown);
        }
        if let Some(socket) = reg.lookup(&dest.addr) {
            let inner = socket.lock();
            if inner.state != State::Closed {
                return Ok(Arc::clone(&inner.connection));
            }
        }
        let socket = self.connect_rank(&mut reg, dest.addr, Some(dest.name.ty), None);
        let con = Arc::clone(&socket.lock().connection);
        Ok(con)
    }

    /// Close the session with `addr`, delivering a reset.
    pub(crate) fn mark_down(&self, addr: &EntityAddr) {
        let mut reg = self.lock_registry();
        let Some(socket) = reg.rank.remove(addr) else {
            tracing::debug!(peer = %addr, "mark_down: no session");
            return;
        };
        tracing::info!(peer = %addr, socket = socket.id(), "mark_down");
        let mut inner = socket.lock();
        socket.stop_locked(&mut inner);
        let con = Arc::clone(&inner.connection);
        if con.clear_socket(&socket) {
            self.dispatch.queue_reset(&con);
        }
    }

    /// Close `con`'s session without a reset event; the caller asked for it.
    pub(crate) fn mark_down_connection(&self, con: &ConnectionRef) {
        let mut reg = self.lock_registry();
        let Link::Socket(socket) = con.try_get_socket() else {
            tracing::debug!(peer = %con.peer_addr(), "mark_down on connection without a session");
            return;
        };
        let peer = {
            let mut inner = socket.lock();
            socket.stop_locked(&mut inner);
            con.clear_socket(&socket);
            inner.peer_addr
        };
        reg.unregister(&peer, &socket);
    }

    pub(crate) fn mark_down_all(&self) {
        let mut reg = self.lock_registry();
        let accepting: Vec<_> = reg.accepting.drain().map(|(_, s)| s).collect();
        let ranked: Vec<_> = reg.rank.drain().map(|(_, s)| s).collect();
        tracing::info!(accepting = accepting.len(), sessions = ranked.len(), "mark_down_all");
        for socket in accepting.iter().chain(ranked.iter()) {
            let mut inner = socket.lock();
            socket.stop_locked(&mut inner);
            let con = Arc::clone(&inner.connection);
            if con.clear_socket(socket) {
                self.dispatch.queue_reset(&con);
            }
        }
    }

    /// Remove a lossy socket that failed from the rank map.
    pub(crate) fn unregister_socket(&self, addr: &EntityAddr, socket: &Socket) {
        self.lock_registry().unregister(addr, socket);
    }

    #[cfg(test)]
    pub(crate) fn register_socket(&self, socket: &Arc<Socket>) {
        let addr = socket.lock().peer_addr;
        self.lock_registry().register_rank(addr, socket);
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self, addr: &EntityAddr) -> Option<Arc<Socket>> {
        self.lock_registry().lookup(addr)
    }

    pub(crate) fn queue_reap(&self, socket: Arc<Socket>) {
        if self.reap_tx.send(socket).is_err() {
            tracing::warn!("reaper gone, socket not reaped");
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.lock_registry().stopping
    }

    pub(crate) fn apply_config(&self, config: MessengerConfig) {
        self.policies.apply_limits(&config);
        self.dispatch.throttle().reset_max(config.dispatch.throttle_bytes);
        self.config.store(Arc::new(config));
        tracing::info!("configuration applied");
    }

    pub(crate) fn status(&self) -> MessengerStatus {
        let (stopping, accepting, sockets) = {
            let reg = self.lock_registry();
            let mut sockets: Vec<_> = reg.sockets.values().cloned().collect();
            sockets.sort_by_key(|s| s.id());
            (reg.stopping, reg.accepting.len(), sockets)
        };
        let throttle = self.dispatch.throttle();
        MessengerStatus {
            name: self.my_name(),
            addr: self.my_addr().to_string(),
            stopping,
            dispatch_queue_len: self.dispatch.len(),
            dispatch_throttle_current: throttle.current(),
            dispatch_throttle_max: throttle.max(),
            accepting,
            sockets: sockets.iter().map(|s| s.status()).collect(),
        }
    }

    /// Stop accepting, close every session and stop the dispatch queue.
    pub(crate) fn shutdown(&self) {
        {
            let mut reg = self.lock_registry();
            if reg.stopping {
                return;
            }
            reg.stopping = true;
        }
        tracing::info!(name = %self.my_name(), "messenger shutting down");
        self.shutdown.trigger();
        self.mark_down_all();
        self.dispatch.shutdown();
    }

    /// Block until `shutdown` has been called and every task has exited.
    pub(crate) async fn wait(&self) {
        self.shutdown.wait().await;
        self.dispatch.wait().await;

        let tasks: Vec<_> =
            std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned"));
        for task in tasks {
            let _ = task.await;
        }

        // never started: reap inline
        let rx = self.reap_rx.lock().expect("reaper mutex poisoned").take();
        if let Some(mut rx) = rx {
            loop {
                while let Ok(socket) = rx.try_recv() {
                    self.reap(socket).await;
                }
                if self.lock_registry().sockets.is_empty() {
                    break;
                }
                self.mark_down_all();
                if let Ok(Some(socket)) = tokio::time::timeout(REAP_POLL, rx.recv()).await {
                    self.reap(socket).await;
                }
            }
        } else {
            loop {
                let notified = self.reaped.notified();
                if self.lock_registry().sockets.is_empty() {
                    break;
                }
                self.mark_down_all();
                let _ = tokio::time::timeout(REAP_POLL, notified).await;
            }
            self.reaper_stop.notify_one();
            let reaper = self.reaper.lock().expect("reaper mutex poisoned").take();
            if let Some(reaper) = reaper {
                let _ = reaper.await;
            }
        }

        self.loopback.clear_priv();
        tracing::info!(name = %self.my_name(), "messenger stopped");
    }

    async fn run_reaper(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<Socket>>) {
        tracing::debug!("reaper started");
        loop {
            tokio::select! {
                biased;
                Some(socket) = rx.recv() => self.reap(socket).await,
                _ = self.reaper_stop.notified() => break,
            }
        }
        while let Ok(socket) = rx.try_recv() {
            self.reap(socket).await;
        }
        tracing::debug!("reaper stopped");
    }

    async fn reap(&self, socket: Arc<Socket>) {
        let (tasks, delay, permit) = {
            let mut reg = self.lock_registry();
            let mut inner = socket.lock();
            let con = Arc::clone(&inner.connection);
            if con.clear_socket(&socket) {
                tracing::debug!(socket = socket.id(), "reaped socket still held its connection");
                self.dispatch.queue_reset(&con);
            }
            reg.unregister(&inner.peer_addr, &socket);
            reg.accepting.remove(&socket.id());
            reg.sockets.remove(&socket.id());
            metrics::set_active_sockets(reg.sockets.len());
            socket.take_for_reap(&mut inner)
        };
        for task in tasks {
            let _ = task.await;
        }
        if let Some(delay) = delay {
            delay.stop().await;
        }
        drop(permit);
        tracing::debug!(socket = socket.id(), "reaped");
        self.reaped.notify_waiters();
    }
}
