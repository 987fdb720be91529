//! Session negotiation for both directions.
//!
//! ```text
//! connector                         acceptor
//!   banner ─────────────────────────→
//!          ←───────────────────────── banner, my addr, your addr
//!   my addr ────────────────────────→
//!   request{gseq, cseq, ...} ───────→
//!          ←───────────────────────── reply{tag, ...}
//!   (RETRY_* / RESETSESSION: new request)
//!   (SEQ: exchange acknowledged sequence numbers)
//! ```
//!
//! The acceptor decides what to do with a request in [`decide_accept`], a
//! pure function over a snapshot of any session it already has with the
//! same peer. Applying the decision happens under the registry lock and
//! both socket locks, so a replace is atomic with respect to every other
//! path that can touch either socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::SocketError;
use crate::messenger::core::Registry;
use crate::messenger::policy::Policy;
use crate::msg::wire::{
    decode_addr, encode_addr, features, ConnectReply, ConnectRequest, Tag, WireError, ADDR_LEN,
    BANNER, CONNECT_LOSSY, CONNECT_REPLY_LEN, CONNECT_REQUEST_LEN, CONNECT_SERVER,
    PROTOCOL_VERSION,
};
use crate::msg::{EntityAddr, EntityType};
use crate::net::socket::{FaultOrigin, Socket, SocketInner, State};
use crate::net::stream::{split, StreamCtl, StreamReader, StreamWriter};
use crate::observability::metrics;

/// How often an acceptor rechecks a session whose reader is inside a
/// fast dispatch.
const DISPATCH_POLL: Duration = Duration::from_millis(10);

/// What the acceptor knows about its current session with the peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExistingView {
    pub state: State,
    pub connect_seq: u32,
    pub peer_global_seq: u32,
    pub attempt_gseq: u32,
    pub lossy: bool,
    pub server: bool,
    pub peer_reset_pending: bool,
}

impl ExistingView {
    fn of(inner: &SocketInner) -> Self {
        Self {
            state: inner.state,
            connect_seq: inner.connect_seq,
            peer_global_seq: inner.peer_global_seq,
            attempt_gseq: inner.attempt_gseq,
            lossy: inner.policy.lossy,
            server: inner.policy.server,
            peer_reset_pending: inner.peer_reset_pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptDecision {
    Open,
    ResetSession,
    RetryGlobal(u32),
    RetrySession { connect_seq: u32, peer_reset: bool },
    Wait,
    /// Take over the existing session. `reset` discards what the peer
    /// already received; `reset_session` also drops what we had queued.
    Replace { reset: bool, reset_session: bool },
}

/// Whether an incoming connect wins a simultaneous-connect race against
/// our own outgoing attempt. Evaluated on both ends with the roles
/// swapped, exactly one side wins unless address and global sequence are
/// identical on both.
pub(crate) fn wins_race(
    req: &ConnectRequest,
    existing: &ExistingView,
    peer_addr: &EntityAddr,
    my_addr: &EntityAddr,
) -> bool {
    match (existing.server, req.is_server()) {
        (true, false) => true,
        (false, true) => false,
        _ => (peer_addr, req.global_seq) < (my_addr, existing.attempt_gseq),
    }
}

pub(crate) fn decide_accept(
    req: &ConnectRequest,
    existing: Option<&ExistingView>,
    resetcheck: bool,
    peer_addr: &EntityAddr,
    my_addr: &EntityAddr,
) -> AcceptDecision {
    let Some(ex) = existing else {
        return if req.connect_seq == 0 {
            AcceptDecision::Open
        } else {
            AcceptDecision::ResetSession
        };
    };

    if req.global_seq < ex.peer_global_seq {
        return AcceptDecision::RetryGlobal(ex.peer_global_seq);
    }

    if ex.lossy {
        return AcceptDecision::Replace {
            reset: true,
            reset_session: false,
        };
    }

    // peer restarted
    if req.connect_seq == 0 && ex.connect_seq > 0 {
        return if resetcheck {
            AcceptDecision::Replace {
                reset: true,
                reset_session: true,
            }
        } else {
            AcceptDecision::RetrySession {
                connect_seq: ex.connect_seq + 1,
                peer_reset: true,
            }
        };
    }

    if req.connect_seq < ex.connect_seq {
        return AcceptDecision::RetrySession {
            connect_seq: ex.connect_seq + 1,
            peer_reset: false,
        };
    }

    if req.connect_seq == ex.connect_seq {
        if matches!(ex.state, State::Open | State::Standby) {
            return AcceptDecision::RetrySession {
                connect_seq: ex.connect_seq + 1,
                peer_reset: false,
            };
        }
        return if wins_race(req, ex, peer_addr, my_addr) {
            AcceptDecision::Replace {
                reset: false,
                reset_session: false,
            }
        } else {
            AcceptDecision::Wait
        };
    }

    if resetcheck && ex.connect_seq == 0 {
        return AcceptDecision::ResetSession;
    }
    AcceptDecision::Replace {
        reset: ex.peer_reset_pending,
        reset_session: false,
    }
}

enum Commit {
    /// Reply and wait for the next request.
    Reply(ConnectReply),
    Opened {
        reply: ConnectReply,
        /// Our receive sequence, sent when the reply tag is `SEQ`.
        in_seq: u64,
    },
    /// The existing session's reader is inside a fast dispatch.
    Busy(Arc<Socket>),
}

fn reply_base(tag: Tag, policy: &Policy, req: &ConnectRequest) -> ConnectReply {
    let mut reply = ConnectReply::new(tag);
    reply.features = (req.features & policy.features_supported) | policy.features_required;
    if policy.lossy {
        reply.flags |= CONNECT_LOSSY;
    }
    reply
}

/// Accept side of a new stream. Runs as the socket's first reader task.
pub(crate) async fn accept(socket: Arc<Socket>, stream: TcpStream, remote: SocketAddr) {
    let config = socket.msgr.config();
    if let Err(e) = stream.set_nodelay(config.listener.nodelay) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let (rd, wr, ctl) = split(
        stream,
        Duration::from_secs(config.timeouts.read_secs),
        config.inject.socket_failures,
    );

    let mut stop = socket.stop_signal();
    let negotiated = tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => Err(SocketError::Shutdown),
        res = tokio::time::timeout(
            Duration::from_millis(config.timeouts.handshake_ms),
            negotiate(&socket, rd, wr, ctl, remote),
        ) => res.unwrap_or(Err(SocketError::Timeout)),
    };

    match negotiated {
        Ok((rd, wr, reply, in_seq)) => finish_accept(&socket, rd, wr, reply, in_seq).await,
        Err(e) => {
            tracing::debug!(socket = socket.id(), remote = %remote, error = %e, "accept failed");
            metrics::record_handshake("accept", "failed");
            socket.stop();
        }
    }
    socket.reader_exited();
}

/// Exchange banners and requests until the session is opened.
async fn negotiate(
    socket: &Arc<Socket>,
    mut rd: StreamReader,
    mut wr: StreamWriter,
    ctl: StreamCtl,
    remote: SocketAddr,
) -> Result<(StreamReader, StreamWriter, ConnectReply, u64), SocketError> {
    let msgr = &socket.msgr;
    let my_addr = msgr.my_addr();

    wr.write_all(BANNER).await?;
    wr.write_all(&encode_addr(&my_addr)).await?;
    wr.write_all(&encode_addr(&EntityAddr::new(remote, 0))).await?;
    wr.flush().await?;

    let mut banner = [0u8; BANNER.len()];
    rd.read_exact(&mut banner).await?;
    if &banner != BANNER {
        return Err(WireError::BadBanner.into());
    }
    let mut raw = [0u8; ADDR_LEN];
    rd.read_exact(&mut raw).await?;
    let mut peer_addr = decode_addr(&raw)?;
    if peer_addr.is_blank_ip() {
        peer_addr.set_ip(remote.ip());
    }
    socket.lock().peer_addr = peer_addr;
    tracing::debug!(socket = socket.id(), peer = %peer_addr, "accept peer addr");

    let mut ctl = Some(ctl);
    loop {
        let mut raw = [0u8; CONNECT_REQUEST_LEN];
        rd.read_exact(&mut raw).await?;
        let req = ConnectRequest::decode(&raw)?;
        let peer_type = u8::try_from(req.host_type)
            .ok()
            .and_then(EntityType::from_u8)
            .ok_or(WireError::UnknownEntityType(req.host_type as u8))?;
        let policy = msgr.policies().get(peer_type);

        tracing::debug!(
            socket = socket.id(),
            peer = %peer_addr,
            peer_type = %peer_type,
            gseq = req.global_seq,
            cseq = req.connect_seq,
            "accept request"
        );

        let reply = if req.protocol_version != PROTOCOL_VERSION {
            Some(reply_base(Tag::BadProtoVer, &policy, &req))
        } else if policy.features_required & !req.features != 0 {
            tracing::info!(
                peer = %peer_addr,
                missing = policy.features_required & !req.features,
                "peer missing required features"
            );
            Some(reply_base(Tag::Features, &policy, &req))
        } else if !msgr.dispatch().dispatchers().verify_authorizer(peer_type, &[]) {
            Some(reply_base(Tag::BadAuthorizer, &policy, &req))
        } else {
            None
        };
        if let Some(reply) = reply {
            wr.write_all(&reply.encode()).await?;
            wr.flush().await?;
            continue;
        }

        let commit = loop {
            match commit_accept(socket, &req, peer_addr, peer_type, &policy, &mut ctl)? {
                Commit::Busy(existing) => {
                    tracing::trace!(socket = socket.id(), "existing session dispatching, waiting");
                    let _ = tokio::time::timeout(DISPATCH_POLL, existing.dispatch_done.notified())
                        .await;
                }
                other => break other,
            }
        };
        match commit {
            Commit::Reply(reply) => {
                metrics::record_handshake("accept", "retry");
                wr.write_all(&reply.encode()).await?;
                wr.flush().await?;
            }
            Commit::Opened { reply, in_seq } => return Ok((rd, wr, reply, in_seq)),
            Commit::Busy(_) => unreachable!("busy is retried above"),
        }
    }
}

/// Decide on a request and apply the decision atomically.
fn commit_accept(
    socket: &Arc<Socket>,
    req: &ConnectRequest,
    peer_addr: EntityAddr,
    peer_type: EntityType,
    policy: &Policy,
    ctl: &mut Option<StreamCtl>,
) -> Result<Commit, SocketError> {
    let msgr = &socket.msgr;
    let my_addr = msgr.my_addr();
    let mut reg = msgr.lock_registry();
    if reg.stopping {
        return Err(SocketError::Shutdown);
    }
    let existing = reg.lookup(&peer_addr).filter(|ex| !Arc::ptr_eq(ex, socket));
    let mut me = socket.lock();
    if me.state == State::Closed {
        return Err(SocketError::Shutdown);
    }

    let mut ex_guard = match &existing {
        Some(ex) => {
            let guard = ex.lock();
            if guard.reader_dispatching {
                return Ok(Commit::Busy(Arc::clone(ex)));
            }
            Some(guard)
        }
        None => None,
    };
    let view = ex_guard.as_deref().map(ExistingView::of);
    let decision = decide_accept(req, view.as_ref(), policy.resetcheck, &peer_addr, &my_addr);
    tracing::debug!(socket = socket.id(), peer = %peer_addr, ?decision, ?view, "accept decision");

    let mut reply = reply_base(Tag::Ready, policy, req);
    let mut reset = true;
    match decision {
        AcceptDecision::Open => {}
        AcceptDecision::ResetSession => {
            reply.tag = Tag::ResetSession as u8;
            return Ok(Commit::Reply(reply));
        }
        AcceptDecision::RetryGlobal(gseq) => {
            reply.tag = Tag::RetryGlobal as u8;
            reply.global_seq = gseq;
            return Ok(Commit::Reply(reply));
        }
        AcceptDecision::RetrySession {
            connect_seq,
            peer_reset,
        } => {
            if peer_reset {
                if let Some(exg) = ex_guard.as_deref_mut() {
                    exg.peer_reset_pending = true;
                }
            }
            reply.tag = Tag::RetrySession as u8;
            reply.connect_seq = connect_seq;
            return Ok(Commit::Reply(reply));
        }
        AcceptDecision::Wait => {
            reply.tag = Tag::Wait as u8;
            return Ok(Commit::Reply(reply));
        }
        AcceptDecision::Replace {
            reset: r,
            reset_session,
        } => {
            let (Some(ex), Some(exg)) = (existing.as_ref(), ex_guard.as_deref_mut()) else {
                return Err(SocketError::Protocol("replace without an existing session".into()));
            };
            if reset_session {
                ex.was_session_reset_locked(exg);
            }
            replace_locked(socket, &mut me, ex, exg, &mut reg, r);
            reset = r || exg.policy.lossy;
        }
    }

    let send_seq = !reset && req.features & features::RECONNECT_SEQ != 0;
    if send_seq {
        reply.tag = Tag::Seq as u8;
    }

    me.state = State::Open;
    me.peer_type = Some(peer_type);
    me.policy = policy.clone();
    me.connect_seq = req.connect_seq + 1;
    me.peer_global_seq = req.global_seq;
    me.peer_reset_pending = false;
    me.backoff.reset();
    reply.connect_seq = me.connect_seq;
    reply.global_seq = msgr.get_global_seq(0);

    let con = Arc::clone(&me.connection);
    con.set_peer(peer_addr, peer_type);
    con.set_features(reply.features & req.features);
    con.reset_socket(socket);

    reg.accepting.remove(&socket.id());
    reg.register_rank(peer_addr, socket);
    if let Some(ctl) = ctl.take() {
        socket.install_stream_locked(&mut me, ctl);
    }
    msgr.dispatch().queue_accept(&con);
    socket.maybe_start_delay_locked(&mut me);

    tracing::info!(
        socket = socket.id(),
        peer = %peer_addr,
        peer_type = %peer_type,
        cseq = me.connect_seq,
        seq = send_seq,
        "accepted session"
    );
    metrics::record_handshake("accept", "open");
    Ok(Commit::Opened {
        reply,
        in_seq: me.in_seq,
    })
}

/// Retire `ex` in favour of `socket`. A lossless session moves over whole:
/// its connection, its unacknowledged and queued messages, and its
/// delayed deliveries.
fn replace_locked(
    socket: &Arc<Socket>,
    me: &mut SocketInner,
    ex: &Arc<Socket>,
    exg: &mut SocketInner,
    reg: &mut Registry,
    reset: bool,
) {
    tracing::info!(
        socket = socket.id(),
        replacing = ex.id(),
        peer = %exg.peer_addr,
        reset,
        "replacing existing session"
    );
    if exg.policy.lossy {
        ex.stop_locked(exg);
        let con = Arc::clone(&exg.connection);
        if con.clear_socket(ex) {
            socket.msgr.dispatch().queue_reset(&con);
        }
    } else {
        let con = Arc::clone(&exg.connection);
        con.reset_socket(socket);
        me.connection = con;
        if let Some(delay) = exg.delay.take() {
            delay.flush();
            me.delay = Some(delay);
        }
        me.in_seq = if reset { 0 } else { exg.in_seq };
        me.in_seq_acked = me.in_seq;
        me.adopt_outgoing(exg);
        ex.stop_locked(exg);
    }
    reg.unregister(&exg.peer_addr, ex);
    metrics::record_session_replaced();
}

/// Write the reply and any sequence exchange, then start the session's
/// reader and writer.
async fn finish_accept(
    socket: &Arc<Socket>,
    mut rd: StreamReader,
    mut wr: StreamWriter,
    reply: ConnectReply,
    in_seq: u64,
) {
    let res: Result<(), SocketError> = async {
        wr.write_all(&reply.encode()).await?;
        if reply.tag() == Some(Tag::Seq) {
            wr.write_all(&in_seq.to_le_bytes()).await?;
            wr.flush().await?;
            let acked = rd.read_u64_le().await?;
            tracing::debug!(socket = socket.id(), acked, "peer acknowledged up to");
            socket.lock().discard_requeued_up_to(acked);
        } else {
            wr.flush().await?;
        }
        Ok(())
    }
    .await;

    let mut inner = socket.lock();
    if inner.state == State::Closed {
        return;
    }
    match res {
        Ok(()) => {
            socket.spawn_writer_locked(&mut inner, Some(wr));
            socket.spawn_reader_locked(&mut inner, rd);
        }
        Err(e) => {
            tracing::debug!(socket = socket.id(), error = %e, "accept failed after registration");
            socket.spawn_writer_locked(&mut inner, None);
            drop(inner);
            socket.fault(FaultOrigin::Writer(None));
        }
    }
}

/// Result of one outgoing handshake attempt.
pub(crate) enum ConnectOutcome {
    Open(StreamWriter),
    /// The socket left `Connecting` (replaced, stopped or told to wait).
    Retry,
}

/// Connect side, run by the writer while the socket is `Connecting`.
pub(crate) async fn connect(socket: &Arc<Socket>) -> Result<ConnectOutcome, SocketError> {
    let config = socket.msgr.config();
    let mut stop = socket.stop_signal();
    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => Ok(ConnectOutcome::Retry),
        res = tokio::time::timeout(
            Duration::from_millis(config.timeouts.handshake_ms),
            connect_session(socket),
        ) => res.unwrap_or(Err(SocketError::Timeout)),
    }
}

async fn connect_session(socket: &Arc<Socket>) -> Result<ConnectOutcome, SocketError> {
    let msgr = &socket.msgr;
    let config = msgr.config();
    let (peer_addr, mut cseq, mut gseq, policy, con) = {
        let mut inner = socket.lock();
        inner.attempt_gseq = msgr.get_global_seq(0);
        (
            inner.peer_addr,
            inner.connect_seq,
            inner.attempt_gseq,
            inner.policy.clone(),
            Arc::clone(&inner.connection),
        )
    };
    tracing::debug!(socket = socket.id(), peer = %peer_addr, cseq, gseq, "connecting");

    let stream = match tokio::time::timeout(
        Duration::from_millis(config.timeouts.connect_ms),
        TcpStream::connect(peer_addr.addr),
    )
    .await
    {
        Err(_) => return Err(SocketError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            msgr.dispatch().queue_refused(&con);
            return Err(SocketError::Refused);
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(config.listener.nodelay)?;
    let (mut rd, mut wr, ctl) = split(
        stream,
        Duration::from_secs(config.timeouts.read_secs),
        config.inject.socket_failures,
    );

    wr.write_all(BANNER).await?;
    wr.flush().await?;
    let mut banner = [0u8; BANNER.len()];
    rd.read_exact(&mut banner).await?;
    if &banner != BANNER {
        return Err(WireError::BadBanner.into());
    }
    let mut raw = [0u8; ADDR_LEN];
    rd.read_exact(&mut raw).await?;
    let paddr = decode_addr(&raw)?;
    rd.read_exact(&mut raw).await?;
    let addr_for_me = decode_addr(&raw)?;
    if !paddr.probably_equals(&peer_addr) {
        return Err(SocketError::Protocol(format!(
            "connected to {paddr}, expected {peer_addr}"
        )));
    }
    msgr.learned_addr(&addr_for_me);
    wr.write_all(&encode_addr(&msgr.my_addr())).await?;

    let mut flags = 0;
    if policy.lossy {
        flags |= CONNECT_LOSSY;
    }
    if policy.server {
        flags |= CONNECT_SERVER;
    }

    loop {
        let req = ConnectRequest {
            features: policy.features_supported,
            host_type: msgr.my_name().ty.as_u8() as u32,
            global_seq: gseq,
            connect_seq: cseq,
            protocol_version: PROTOCOL_VERSION,
            flags,
        };
        wr.write_all(&req.encode()).await?;
        wr.flush().await?;

        let mut raw = [0u8; CONNECT_REPLY_LEN];
        rd.read_exact(&mut raw).await?;
        let reply = ConnectReply::decode(&raw)?;

        // the guard must not live across the SEQ exchange below
        let seq_pending = {
            let mut inner = socket.lock();
            if inner.state != State::Connecting {
                tracing::debug!(socket = socket.id(), state = %inner.state, "no longer connecting");
                return Ok(ConnectOutcome::Retry);
            }
            match reply.tag() {
                Some(Tag::ResetSession) => {
                    socket.was_session_reset_locked(&mut inner);
                    cseq = 0;
                    continue;
                }
                Some(Tag::RetryGlobal) => {
                    gseq = msgr.get_global_seq(reply.global_seq);
                    inner.attempt_gseq = gseq;
                    tracing::debug!(socket = socket.id(), gseq, "retry global");
                    continue;
                }
                Some(Tag::RetrySession) => {
                    cseq = reply.connect_seq;
                    inner.connect_seq = cseq;
                    tracing::debug!(socket = socket.id(), cseq, "retry session");
                    continue;
                }
                Some(Tag::Wait) => {
                    tracing::debug!(socket = socket.id(), "lost connect race, waiting");
                    inner.state = State::Wait;
                    inner.wait_deadline =
                        Some(Instant::now() + Duration::from_millis(config.timeouts.wait_ms));
                    metrics::record_handshake("connect", "wait");
                    return Ok(ConnectOutcome::Retry);
                }
                Some(tag @ (Tag::Ready | Tag::Seq)) => {
                    let missing = policy.features_required & !reply.features;
                    if missing != 0 {
                        return Err(SocketError::Protocol(format!(
                            "peer missing required features {missing:#x}"
                        )));
                    }
                    tag == Tag::Seq
                }
                other => {
                    metrics::record_handshake("connect", "failed");
                    return Err(SocketError::Protocol(match other {
                        Some(tag) => format!("connect rejected: {tag:?}"),
                        None => format!("connect rejected: unknown tag {}", reply.tag),
                    }));
                }
            }
        };

        if seq_pending {
            let acked = rd.read_u64_le().await?;
            let in_seq = {
                let mut inner = socket.lock();
                inner.discard_requeued_up_to(acked);
                inner.in_seq
            };
            tracing::debug!(socket = socket.id(), acked, in_seq, "seq exchange");
            wr.write_all(&in_seq.to_le_bytes()).await?;
            wr.flush().await?;
        }

        let mut inner = socket.lock();
        if inner.state != State::Connecting {
            return Ok(ConnectOutcome::Retry);
        }
        inner.state = State::Open;
        inner.connect_seq = cseq + 1;
        inner.peer_global_seq = reply.global_seq;
        inner.policy.lossy = reply.flags & CONNECT_LOSSY != 0;
        inner.backoff.reset();
        let con = Arc::clone(&inner.connection);
        con.set_features(reply.features & policy.features_supported);
        msgr.dispatch().queue_connect(&con);
        socket.install_stream_locked(&mut inner, ctl);
        socket.spawn_reader_locked(&mut inner, rd);
        socket.maybe_start_delay_locked(&mut inner);
        tracing::info!(
            socket = socket.id(),
            peer = %peer_addr,
            cseq = inner.connect_seq,
            lossy = inner.policy.lossy,
            "connected"
        );
        metrics::record_handshake("connect", "open");
        return Ok(ConnectOutcome::Open(wr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn addr(s: &str) -> EntityAddr {
        s.parse().unwrap()
    }

    fn request(gseq: u32, cseq: u32) -> ConnectRequest {
        ConnectRequest {
            features: features::SUPPORTED,
            host_type: EntityType::Osd.as_u8() as u32,
            global_seq: gseq,
            connect_seq: cseq,
            protocol_version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    fn existing(state: State, cseq: u32) -> ExistingView {
        ExistingView {
            state,
            connect_seq: cseq,
            peer_global_seq: 5,
            attempt_gseq: 10,
            lossy: false,
            server: false,
            peer_reset_pending: false,
        }
    }

    #[test]
    fn fresh_peer_opens() {
        let me = addr("10.0.0.1:6800/1");
        let peer = addr("10.0.0.2:6800/1");
        assert_eq!(
            decide_accept(&request(1, 0), None, true, &peer, &me),
            AcceptDecision::Open
        );
        assert_eq!(
            decide_accept(&request(1, 3), None, true, &peer, &me),
            AcceptDecision::ResetSession
        );
    }

    #[test]
    fn restarted_peer_without_resetcheck_retries_session() {
        let me = addr("10.0.0.1:6800/1");
        let peer = addr("10.0.0.2:6800/1");
        let ex = existing(State::Open, 3);
        assert_eq!(
            decide_accept(&request(6, 0), Some(&ex), false, &peer, &me),
            AcceptDecision::RetrySession {
                connect_seq: 4,
                peer_reset: true
            }
        );
        assert_eq!(
            decide_accept(&request(6, 0), Some(&ex), true, &peer, &me),
            AcceptDecision::Replace {
                reset: true,
                reset_session: true
            }
        );
    }

    #[test]
    fn stale_global_seq_retries_global() {
        let me = addr("10.0.0.1:6800/1");
        let peer = addr("10.0.0.2:6800/1");
        let ex = existing(State::Open, 3);
        assert_eq!(
            decide_accept(&request(4, 3), Some(&ex), true, &peer, &me),
            AcceptDecision::RetryGlobal(5)
        );
    }

    #[test]
    fn lossy_existing_is_replaced() {
        let me = addr("10.0.0.1:6800/1");
        let peer = addr("10.0.0.2:6800/1");
        let mut ex = existing(State::Open, 3);
        ex.lossy = true;
        assert_eq!(
            decide_accept(&request(6, 1), Some(&ex), true, &peer, &me),
            AcceptDecision::Replace {
                reset: true,
                reset_session: false
            }
        );
    }

    #[test]
    fn connect_seq_ordering() {
        let me = addr("10.0.0.1:6800/1");
        let peer = addr("10.0.0.2:6800/1");
        let ex = existing(State::Standby, 3);
        assert_eq!(
            decide_accept(&request(6, 2), Some(&ex), true, &peer, &me),
            AcceptDecision::RetrySession {
                connect_seq: 4,
                peer_reset: false
            }
        );
        assert_eq!(
            decide_accept(&request(6, 3), Some(&ex), true, &peer, &me),
            AcceptDecision::RetrySession {
                connect_seq: 4,
                peer_reset: false
            }
        );
        assert_eq!(
            decide_accept(&request(6, 4), Some(&ex), true, &peer, &me),
            AcceptDecision::Replace {
                reset: false,
                reset_session: false
            }
        );

        let mut pending = ex;
        pending.peer_reset_pending = true;
        assert_eq!(
            decide_accept(&request(6, 4), Some(&pending), true, &peer, &me),
            AcceptDecision::Replace {
                reset: true,
                reset_session: false
            }
        );

        let never_opened = existing(State::Connecting, 0);
        assert_eq!(
            decide_accept(&request(6, 1), Some(&never_opened), true, &peer, &me),
            AcceptDecision::ResetSession
        );
    }

    #[test]
    fn race_resolution_by_address() {
        let low = addr("10.0.0.1:6800/1");
        let high = addr("10.0.0.2:6800/1");
        let ex = existing(State::Connecting, 2);
        // incoming from the lower address wins
        assert_eq!(
            decide_accept(&request(6, 2), Some(&ex), true, &low, &high),
            AcceptDecision::Replace {
                reset: false,
                reset_session: false
            }
        );
        assert_eq!(
            decide_accept(&request(6, 2), Some(&ex), true, &high, &low),
            AcceptDecision::Wait
        );
    }

    #[test]
    fn server_side_always_yields_to_client() {
        let low = addr("10.0.0.1:6800/1");
        let high = addr("10.0.0.2:6800/1");
        let mut ex = existing(State::Wait, 2);
        ex.server = true;
        assert_eq!(
            decide_accept(&request(6, 2), Some(&ex), true, &high, &low),
            AcceptDecision::Replace {
                reset: false,
                reset_session: false
            }
        );
    }

    /// Both ends of a simultaneous connect evaluate the race with their
    /// roles swapped; exactly one of them must accept the other's attempt.
    #[test]
    fn race_outcomes_are_complementary() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let a = EntityAddr::new(
                format!("10.0.0.{}:{}", rng.gen_range(1..4), rng.gen_range(6800..6803))
                    .parse()
                    .unwrap(),
                rng.gen_range(0..3),
            );
            let b = EntityAddr::new(
                format!("10.0.0.{}:{}", rng.gen_range(1..4), rng.gen_range(6800..6803))
                    .parse()
                    .unwrap(),
                rng.gen_range(0..3),
            );
            let (ga, gb) = (rng.gen_range(1..4u32), rng.gen_range(1..4u32));
            let (a_server, b_server) = (rng.gen_bool(0.3), rng.gen_bool(0.3));

            // a receives b's attempt
            let mut req_from_b = request(gb, 1);
            if b_server {
                req_from_b.flags |= CONNECT_SERVER;
            }
            let a_view = ExistingView {
                attempt_gseq: ga,
                server: a_server,
                ..existing(State::Connecting, 1)
            };
            let a_accepts = wins_race(&req_from_b, &a_view, &b, &a);

            // b receives a's attempt
            let mut req_from_a = request(ga, 1);
            if a_server {
                req_from_a.flags |= CONNECT_SERVER;
            }
            let b_view = ExistingView {
                attempt_gseq: gb,
                server: b_server,
                ..existing(State::Connecting, 1)
            };
            let b_accepts = wins_race(&req_from_a, &b_view, &a, &b);

            let tie = a == b && ga == gb && a_server == b_server;
            if tie {
                assert!(!a_accepts && !b_accepts);
            } else {
                assert_ne!(
                    a_accepts, b_accepts,
                    "a={a} ga={ga} as={a_server} b={b} gb={gb} bs={b_server}"
                );
            }
        }
    }
}
