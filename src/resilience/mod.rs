//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Socket fault on a lossless session:
//!     → requeue unacknowledged messages
//!     → backoff.rs (next delay, doubling up to the ceiling)
//!     → writer sleeps, then reconnects
//!     → successful handshake resets the backoff
//! ```
//!
//! # Design Decisions
//! - The first reconnect after a working session is immediate
//! - Backoff state lives with the socket, not globally per peer

pub mod backoff;
