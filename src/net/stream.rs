//! Interruptible halves of one TCP stream.
//!
//! Every read and write races the stream's shutdown signal, so a fault or
//! stop on any task unblocks the tasks using the same stream. Reads also
//! carry the liveness timeout.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::SocketError;
use crate::msg::wire::EncodedMessage;

static STREAM_GEN: AtomicU64 = AtomicU64::new(1);

/// Fail on average once every `every` calls. 0 disables.
pub(crate) fn inject_failure(every: u32) -> Result<(), SocketError> {
    if every > 0 && fastrand::u32(..every) == 0 {
        tracing::debug!(every, "injecting socket failure");
        return Err(SocketError::Injected);
    }
    Ok(())
}

/// Owner's handle on a stream: identifies it and shuts it down.
#[derive(Debug)]
pub(crate) struct StreamCtl {
    pub(crate) gen: u64,
    shutdown: watch::Sender<bool>,
}

impl StreamCtl {
    pub(crate) fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Split a connected stream into its reader, writer and control handle.
pub(crate) fn split(
    stream: TcpStream,
    read_timeout: Duration,
    inject: u32,
) -> (StreamReader, StreamWriter, StreamCtl) {
    let gen = STREAM_GEN.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = watch::channel(false);
    let (rd, wr) = stream.into_split();
    (
        StreamReader {
            inner: BufReader::new(rd),
            shutdown: rx.clone(),
            timeout: read_timeout,
            inject,
            gen,
        },
        StreamWriter {
            inner: BufWriter::new(wr),
            shutdown: rx,
            inject,
            gen,
        },
        StreamCtl { gen, shutdown: tx },
    )
}

pub(crate) struct StreamReader {
    inner: BufReader<OwnedReadHalf>,
    shutdown: watch::Receiver<bool>,
    timeout: Duration,
    inject: u32,
    gen: u64,
}

impl StreamReader {
    pub(crate) fn gen(&self) -> u64 {
        self.gen
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SocketError> {
        inject_failure(self.inject)?;
        let Self {
            inner,
            shutdown,
            timeout,
            ..
        } = self;
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(SocketError::Shutdown),
            res = tokio::time::timeout(*timeout, inner.read_exact(buf)) => match res {
                Err(_) => Err(SocketError::Timeout),
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok(_)) => Ok(()),
            },
        }
    }

    pub(crate) async fn read_u8(&mut self) -> Result<u8, SocketError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    pub(crate) async fn read_u64_le(&mut self) -> Result<u64, SocketError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b).await?;
        Ok(u64::from_le_bytes(b))
    }

    /// Read `len` bytes into `buf` (or a fresh allocation).
    pub(crate) async fn read_bytes(
        &mut self,
        len: usize,
        buf: Option<BytesMut>,
    ) -> Result<Bytes, SocketError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = buf.unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        self.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Await `fut` unless the stream is shut down first.
    pub(crate) async fn guard<F: Future>(&mut self, fut: F) -> Result<F::Output, SocketError> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|stop| *stop) => Err(SocketError::Shutdown),
            out = fut => Ok(out),
        }
    }
}

pub(crate) struct StreamWriter {
    inner: BufWriter<OwnedWriteHalf>,
    shutdown: watch::Receiver<bool>,
    inject: u32,
    gen: u64,
}

impl StreamWriter {
    pub(crate) fn gen(&self) -> u64 {
        self.gen
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<(), SocketError> {
        inject_failure(self.inject)?;
        let Self {
            inner, shutdown, ..
        } = self;
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(SocketError::Shutdown),
            res = inner.write_all(buf) => res.map_err(SocketError::from),
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: &EncodedMessage) -> Result<(), SocketError> {
        for chunk in [&frame.head, &frame.front, &frame.middle, &frame.data, &frame.footer] {
            if !chunk.is_empty() {
                self.write_all(chunk).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), SocketError> {
        let Self {
            inner, shutdown, ..
        } = self;
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(SocketError::Shutdown),
            res = inner.flush() => res.map_err(SocketError::from),
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn shutdown_interrupts_blocked_read() {
        let (a, _b) = pair().await;
        let (mut rd, _wr, ctl) = split(a, Duration::from_secs(30), 0);
        let reader = tokio::spawn(async move { rd.read_u8().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctl.shutdown();
        let res = reader.await.unwrap();
        assert!(matches!(res, Err(SocketError::Shutdown)));
    }

    #[tokio::test]
    async fn read_times_out() {
        let (a, _b) = pair().await;
        let (mut rd, _wr, _ctl) = split(a, Duration::from_millis(30), 0);
        assert!(matches!(rd.read_u8().await, Err(SocketError::Timeout)));
    }

    #[tokio::test]
    async fn bytes_cross_the_stream() {
        let (a, b) = pair().await;
        let (_ra, mut wa, _ca) = split(a, Duration::from_secs(5), 0);
        let (mut rb, _wb, _cb) = split(b, Duration::from_secs(5), 0);
        wa.write_all(&42u64.to_le_bytes()).await.unwrap();
        wa.write_all(b"hello").await.unwrap();
        wa.flush().await.unwrap();
        assert_eq!(rb.read_u64_le().await.unwrap(), 42);
        assert_eq!(&rb.read_bytes(5, None).await.unwrap()[..], b"hello");
    }

    #[test]
    fn injection_eventually_fires() {
        assert!(inject_failure(0).is_ok());
        assert!((0..10_000).any(|_| inject_failure(2).is_err()));
    }
}
