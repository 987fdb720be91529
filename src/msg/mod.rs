//! Message model and wire codec.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     Message (front/middle/data as Bytes)
//!     → writer assigns seq + source
//!     → wire.rs encode_message (header crc, footer crcs)
//!     → stream
//!
//! Inbound:
//!     stream → tag byte
//!     → wire.rs MessageHeader::decode (header crc)
//!     → payload regions (optionally into a posted buffer)
//!     → MessageFooter::verify
//!     → Message::from_wire
//! ```
//!
//! # Design Decisions
//! - Payload regions are reference-counted; retransmission never copies
//! - Fixed-size structures are encoded with explicit little-endian puts
//! - Decoding is pure and usable on in-memory frames

pub mod message;
pub mod types;
pub mod wire;

pub use message::{Message, PRIO_DEFAULT, PRIO_HIGH, PRIO_HIGHEST, PRIO_LOW};
pub use types::{EntityAddr, EntityInst, EntityName, EntityType};
