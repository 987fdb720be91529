//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Messenger::shutdown → trigger → accepter stops → sockets marked down
//!     Messenger::wait     → waits on the same trigger, then drains
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → SignalEvent::Shutdown
//!     SIGHUP         → SignalEvent::Reload
//! ```
//!
//! # Design Decisions
//! - Shutdown is one-shot; a late subscriber still observes it
//! - Signals are translated to events; the binary decides what to do

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{next_signal, SignalEvent};
