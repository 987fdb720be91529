//! Reliable, session-oriented messaging between named entities over TCP.
//!
//! A [`Messenger`] owns one listen address and a session per peer. Lossless
//! sessions survive TCP failures: unacknowledged messages are resent after
//! reconnecting and duplicates are dropped, so each message is delivered
//! exactly once and in order. Lossy sessions fail fast and report a reset.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod messenger;
pub mod msg;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod throttle;

pub use config::MessengerConfig;
pub use dispatch::{Delivery, Dispatcher};
pub use error::{MessengerError, MessengerResult};
pub use lifecycle::Shutdown;
pub use messenger::{Messenger, MessengerStatus, Policy};
pub use msg::{EntityAddr, EntityInst, EntityName, EntityType, Message};
pub use net::{ConnectionRef, SocketState, SocketStatus};
pub use throttle::Throttle;
