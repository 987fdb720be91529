//! Inbound side of the messenger: the listen socket and its accept task.
//!
//! Each accepted stream becomes an `Accepting` socket in the messenger. The
//! number of accepted sockets alive at once is capped by
//! `listener.max_connections`; the cap is a semaphore whose permit travels
//! with the socket and is returned when the reaper drops it.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::messenger::core::MessengerCore;

#[derive(Debug, Error)]
pub enum AccepterError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error("accepter closed")]
    Closed,
}

/// Listen socket plus the slot pool for accepted sockets. Once every slot
/// is taken, further peers sit in the kernel backlog.
pub struct Accepter {
    listener: TcpListener,
    slots: Arc<Semaphore>,
    limit: usize,
}

impl Accepter {
    pub async fn bind(addr: SocketAddr, config: &ListenerConfig) -> Result<Self, AccepterError> {
        let listener = TcpListener::bind(addr).await.map_err(AccepterError::Bind)?;
        let bound = listener.local_addr().map_err(AccepterError::Bind)?;
        tracing::info!(addr = %bound, limit = config.max_connections, "listening");

        Ok(Self {
            listener,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            limit: config.max_connections,
        })
    }

    /// Wait for a free slot, then for a peer.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, AcceptPermit), AccepterError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| AccepterError::Closed)?;
        let (stream, remote) = self.listener.accept().await.map_err(AccepterError::Accept)?;
        tracing::debug!(%remote, free_slots = self.slots.available_permits(), "accepted");
        Ok((stream, remote, AcceptPermit { _slot: slot }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.limit
    }

    /// Accept until `shutdown` fires, handing each stream to `msgr`.
    pub(crate) async fn run(self, msgr: Arc<MessengerCore>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("accepter stopping");
                    break;
                }
                res = self.accept() => match res {
                    Ok((stream, remote, permit)) => msgr.add_accept(stream, remote, permit),
                    Err(AccepterError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }
}

/// Slot held by one accepted socket until it is reaped.
#[derive(Debug)]
pub struct AcceptPermit {
    _slot: OwnedSemaphorePermit,
}
