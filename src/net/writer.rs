//! Writer task: drives the outgoing half of a socket.
//!
//! The writer owns the state machine transitions that need I/O on our side:
//! it runs the connect handshake, sits out `Wait`, leaves `Standby` when
//! something is queued, and writes the final `CLOSE`. While `Open` it writes
//! and flushes one batch at a time (keepalives, an ack, then one message) and
//! sleeps on `writer_wake` when there is nothing to do. A frame is on the wire
//! before the next message is taken off the queue.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;

use crate::error::SocketError;
use crate::msg::wire::{encode_message, encode_stamp, features, MessageHeader, Tag};
use crate::net::handshake::{self, ConnectOutcome};
use crate::net::socket::{FaultOrigin, Socket, State};
use crate::net::stream::StreamWriter;
use crate::observability::metrics;

enum Outgoing {
    Keepalive,
    Keepalive2(SystemTime),
    Keepalive2Ack(SystemTime),
    Ack(u64),
    Message {
        header: MessageHeader,
        front: Bytes,
        middle: Bytes,
        data: Bytes,
    },
}

enum Step {
    Exit,
    Connect,
    Wait(Instant),
    Close,
    Write(Vec<Outgoing>),
    /// Open with no stream attached.
    Lost,
    Idle,
}

pub(crate) async fn run(socket: Arc<Socket>, mut stream: Option<StreamWriter>) {
    let mut stop = socket.stop_signal();
    tracing::trace!(socket = socket.id(), "writer started");

    loop {
        match next_step(&socket, &mut stream) {
            Step::Exit => break,
            Step::Connect => match handshake::connect(&socket).await {
                Ok(ConnectOutcome::Open(w)) => stream = Some(w),
                Ok(ConnectOutcome::Retry) => {}
                Err(e) => {
                    tracing::debug!(socket = socket.id(), error = %e, "connect attempt failed");
                    if !matches!(e, SocketError::Refused) {
                        metrics::record_handshake("connect", "failed");
                    }
                    if let Some(delay) = socket.fault(FaultOrigin::Writer(None)) {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.wait_for(|stopped| *stopped) => {}
                        }
                    }
                }
            },
            Step::Wait(deadline) => {
                tokio::select! {
                    _ = socket.writer_wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => socket.wait_expired(),
                }
            }
            Step::Close => {
                if let Some(mut w) = stream.take() {
                    let res = async {
                        w.write_all(&[Tag::Close as u8]).await?;
                        w.flush().await
                    }
                    .await;
                    if let Err(e) = res {
                        tracing::debug!(socket = socket.id(), error = %e, "failed to write close");
                    }
                }
                socket.stop();
            }
            Step::Lost => {
                socket.fault(FaultOrigin::Writer(None));
            }
            Step::Write(items) => {
                let Some(w) = stream.as_mut() else {
                    continue;
                };
                let gen = w.gen();
                let crc_data = socket.msgr.config().wire.crc_data;
                if let Err(e) = write_items(w, items, crc_data).await {
                    tracing::debug!(socket = socket.id(), gen, error = %e, "write failed");
                    stream = None;
                    if let Some(delay) = socket.fault(FaultOrigin::Writer(Some(gen))) {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.wait_for(|stopped| *stopped) => {}
                        }
                    }
                }
            }
            Step::Idle => socket.writer_wake.notified().await,
        }
    }

    drop(stream);
    tracing::trace!(socket = socket.id(), "writer exiting");
    socket.writer_exited();
}

/// Decide the next action under the socket lock.
fn next_step(socket: &Socket, stream: &mut Option<StreamWriter>) -> Step {
    let mut inner = socket.lock();
    if stream
        .as_ref()
        .is_some_and(|w| w.is_shut_down() || !inner.is_current_stream(w.gen()))
    {
        *stream = None;
    }

    match inner.state {
        State::Closed => Step::Exit,
        State::Closing => {
            socket.mark_closed_locked(&mut inner);
            Step::Close
        }
        State::Connecting => Step::Connect,
        State::Wait => match inner.wait_deadline {
            Some(deadline) => Step::Wait(deadline),
            None => {
                inner.state = State::Connecting;
                Step::Connect
            }
        },
        State::Standby if !inner.policy.server && inner.is_queued() => {
            tracing::debug!(socket = socket.id(), peer = %inner.peer_addr, "leaving standby to send");
            inner.connect_seq += 1;
            inner.state = State::Connecting;
            Step::Connect
        }
        State::Open if stream.is_none() => Step::Lost,
        State::Open => {
            let mut items = Vec::new();
            if inner.keepalive {
                inner.keepalive = false;
                if inner.connection.has_feature(features::KEEPALIVE2) {
                    items.push(Outgoing::Keepalive2(SystemTime::now()));
                } else {
                    items.push(Outgoing::Keepalive);
                }
            }
            if let Some(stamp) = inner.keepalive_ack.take() {
                items.push(Outgoing::Keepalive2Ack(stamp));
            }
            if inner.in_seq > inner.in_seq_acked {
                inner.in_seq_acked = inner.in_seq;
                items.push(Outgoing::Ack(inner.in_seq));
            }
            if let Some(mut m) = inner.next_outgoing() {
                if m.seq() == 0 {
                    inner.out_seq += 1;
                    m.set_seq(inner.out_seq);
                }
                m.set_source(socket.msgr.my_name());
                let (front, middle, data) = m.payload();
                items.push(Outgoing::Message {
                    header: *m.header(),
                    front,
                    middle,
                    data,
                });
                tracing::trace!(
                    socket = socket.id(),
                    seq = m.seq(),
                    msg_type = m.msg_type(),
                    "writing message"
                );
                if !inner.policy.lossy {
                    inner.sent.push_back(m);
                }
            }
            if items.is_empty() {
                Step::Idle
            } else {
                Step::Write(items)
            }
        }
        State::Accepting | State::Standby => Step::Idle,
    }
}

async fn write_items(
    w: &mut StreamWriter,
    items: Vec<Outgoing>,
    crc_data: bool,
) -> Result<(), SocketError> {
    for item in items {
        match item {
            Outgoing::Keepalive => w.write_all(&[Tag::Keepalive as u8]).await?,
            Outgoing::Keepalive2(stamp) => {
                w.write_all(&[Tag::Keepalive2 as u8]).await?;
                w.write_all(&encode_stamp(stamp)).await?;
            }
            Outgoing::Keepalive2Ack(stamp) => {
                w.write_all(&[Tag::Keepalive2Ack as u8]).await?;
                w.write_all(&encode_stamp(stamp)).await?;
            }
            Outgoing::Ack(seq) => {
                w.write_all(&[Tag::Ack as u8]).await?;
                w.write_all(&seq.to_le_bytes()).await?;
            }
            Outgoing::Message {
                header,
                front,
                middle,
                data,
            } => {
                let frame = encode_message(&header, front, middle, data, crc_data);
                w.write_frame(&frame).await?;
                metrics::record_message_sent(frame.len());
            }
        }
    }
    w.flush().await
}
