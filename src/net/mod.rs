//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → accepter.rs (accept loop, connection limit)
//!     → handshake.rs accept (banner, addresses, race resolution)
//!     → socket.rs (session state, queues, sequence numbers)
//!     → reader.rs / writer.rs (one task each per stream)
//!
//! Outgoing session
//!     → socket.rs created Connecting by the messenger
//!     → writer.rs runs handshake.rs connect, then writes
//!
//! Received messages
//!     reader.rs → delayed.rs (optional) → dispatch queue or fast dispatch
//! ```
//!
//! # Design Decisions
//! - A `Connection` outlives the sockets that carry it; a lossless replace
//!   moves the connection and its unacknowledged messages to the new socket
//! - Every stream has a generation; a task holding a stale stream can never
//!   change the socket's state
//! - Closed sockets are torn down by the messenger's reaper once their
//!   reader and writer have exited

pub mod accepter;
pub mod connection;
pub(crate) mod delayed;
pub(crate) mod handshake;
pub(crate) mod reader;
pub mod socket;
pub(crate) mod stream;
pub(crate) mod writer;

pub use accepter::{Accepter, AccepterError};
pub use connection::{Attachment, Connection, ConnectionId, ConnectionRef};
pub use socket::{SocketStatus, State as SocketState};
