//! Reader task: one per installed stream.
//!
//! Reads frames until the stream fails or the peer closes. Each message is
//! admitted through the policy throttles and the dispatch throttle before
//! its payload is read, checked against `in_seq` for duplicates, then
//! handed to delayed delivery, fast dispatch or the dispatch queue.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::error::SocketError;
use crate::msg::wire::{
    decode_stamp, DecodedMessage, MessageFooter, MessageHeader, Tag, WireError, FOOTER_LEN,
    HEADER_LEN, STAMP_LEN,
};
use crate::msg::Message;
use crate::net::socket::{FaultOrigin, Socket, State};
use crate::net::stream::StreamReader;
use crate::observability::metrics;

pub(crate) async fn run(socket: Arc<Socket>, mut rd: StreamReader) {
    let gen = rd.gen();
    tracing::trace!(socket = socket.id(), gen, "reader started");

    if let Err(e) = read_loop(&socket, &mut rd).await {
        tracing::debug!(socket = socket.id(), gen, error = %e, "reader fault");
        socket.fault(FaultOrigin::Reader(gen));
    }

    drop(rd);
    tracing::trace!(socket = socket.id(), gen, "reader exiting");
    socket.reader_exited();
}

async fn read_loop(socket: &Arc<Socket>, rd: &mut StreamReader) -> Result<(), SocketError> {
    let gen = rd.gen();
    loop {
        let tag = rd.read_u8().await?;
        let con = Arc::clone(&socket.lock().connection);
        match Tag::from_u8(tag) {
            Some(Tag::Keepalive) => {
                tracing::trace!(socket = socket.id(), "got keepalive");
                con.set_last_keepalive(SystemTime::now());
            }
            Some(Tag::Keepalive2) => {
                let mut raw = [0u8; STAMP_LEN];
                rd.read_exact(&mut raw).await?;
                let stamp = decode_stamp(&raw)?;
                con.set_last_keepalive(SystemTime::now());
                socket.lock().keepalive_ack = Some(stamp);
                socket.writer_wake.notify_one();
            }
            Some(Tag::Keepalive2Ack) => {
                let mut raw = [0u8; STAMP_LEN];
                rd.read_exact(&mut raw).await?;
                con.set_last_keepalive_ack(decode_stamp(&raw)?);
            }
            Some(Tag::Ack) => {
                let seq = rd.read_u64_le().await?;
                tracing::trace!(socket = socket.id(), seq, "got ack");
                socket.lock().handle_ack(seq);
            }
            Some(Tag::Msg) => match read_message(socket, rd).await {
                Ok(Some(m)) => {
                    if !deliver(socket, gen, m) {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            },
            Some(Tag::Close) => {
                let mut inner = socket.lock();
                tracing::debug!(socket = socket.id(), peer = %inner.peer_addr, "got close");
                if inner.state == State::Closing {
                    socket.stop_locked(&mut inner);
                } else {
                    inner.state = State::Closing;
                    socket.writer_wake.notify_one();
                }
                return Ok(());
            }
            _ => return Err(WireError::UnknownTag(tag).into()),
        }
    }
}

/// Read one `MSG` frame body. Returns `None` for a frame discarded on a
/// payload checksum mismatch or a sender abort.
async fn read_message(
    socket: &Arc<Socket>,
    rd: &mut StreamReader,
) -> Result<Option<Message>, SocketError> {
    let (policy, con) = {
        let inner = socket.lock();
        (inner.policy.clone(), Arc::clone(&inner.connection))
    };
    let config = socket.msgr.config();

    let mut raw = [0u8; HEADER_LEN];
    rd.read_exact(&mut raw).await?;
    let header = MessageHeader::decode(&raw, config.wire.crc_header)?;
    let len = header.payload_len();
    if len > config.wire.max_message_bytes {
        return Err(WireError::TooLarge {
            size: len,
            max: config.wire.max_message_bytes,
        }
        .into());
    }

    let mut permits = Vec::with_capacity(2);
    if let Some(t) = &policy.throttler_messages {
        permits.push(rd.guard(t.acquire(1)).await?);
    }
    if let Some(t) = &policy.throttler_bytes {
        permits.push(rd.guard(t.acquire(len)).await?);
    }
    let dispatch_throttle = socket.msgr.dispatch().throttle();
    let dispatch_permit = rd.guard(dispatch_throttle.acquire(len)).await?;

    let front = rd.read_bytes(header.front_len as usize, None).await?;
    let middle = rd.read_bytes(header.middle_len as usize, None).await?;
    let posted = con.take_rx_buffer(header.tid, header.data_len as usize);
    if posted.is_some() {
        tracing::trace!(socket = socket.id(), tid = header.tid, "reading into posted buffer");
    }
    let data = rd.read_bytes(header.data_len as usize, posted).await?;

    let mut raw = [0u8; FOOTER_LEN];
    rd.read_exact(&mut raw).await?;
    let footer = MessageFooter::decode(&raw)?;
    if let Err(e) = footer.verify(&front, &middle, &data, config.wire.crc_data) {
        tracing::warn!(
            socket = socket.id(),
            seq = header.seq,
            error = %e,
            "discarding message"
        );
        return Ok(None);
    }

    let mut m = Message::from_wire(DecodedMessage {
        header,
        front,
        middle,
        data,
        footer,
    });
    for permit in permits {
        m.add_throttle_permit(permit);
    }
    m.set_dispatch_permit(dispatch_permit);
    m.set_connection(con);
    m.set_recv_stamp(Instant::now());
    metrics::record_message_received(len as usize);
    Ok(Some(m))
}

/// Sequence-check and route a received message. Returns false once this
/// stream is no longer the socket's current one.
fn deliver(socket: &Arc<Socket>, gen: u64, m: Message) -> bool {
    let dispatch = Arc::clone(socket.msgr.dispatch());
    dispatch.fast_preprocess(&m);

    let mut inner = socket.lock();
    if !inner.is_current_stream(gen) || matches!(inner.state, State::Closed | State::Connecting) {
        tracing::debug!(socket = socket.id(), seq = m.seq(), "stream replaced, dropping message");
        return false;
    }
    if m.seq() <= inner.in_seq {
        tracing::debug!(
            socket = socket.id(),
            seq = m.seq(),
            in_seq = inner.in_seq,
            "dropping duplicate message"
        );
        metrics::record_duplicate_dropped();
        return true;
    }
    if m.seq() > inner.in_seq + 1 {
        tracing::warn!(
            socket = socket.id(),
            seq = m.seq(),
            expected = inner.in_seq + 1,
            "sequence gap"
        );
    }
    inner.in_seq = m.seq();
    socket.writer_wake.notify_one();

    if let Some(delay) = inner.delay.clone() {
        let config = socket.msgr.config();
        let inject = &config.inject;
        let recv = m.recv_stamp().unwrap_or_else(Instant::now);
        let release = if fastrand::f64() < inject.delay_probability {
            recv + Duration::from_millis((fastrand::f64() * inject.delay_max_ms as f64) as u64)
        } else {
            recv
        };
        drop(inner);
        delay.queue(release, m);
        return true;
    }

    if dispatch.can_fast_dispatch(&m) {
        inner.reader_dispatching = true;
        drop(inner);
        dispatch.fast_dispatch(m);
        socket.lock().reader_dispatching = false;
        socket.dispatch_done.notify_waiters();
    } else {
        let class = inner.connection.id();
        let priority = m.priority();
        dispatch.enqueue(m, priority, class);
    }
    true
}
