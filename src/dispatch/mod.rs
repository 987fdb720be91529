//! Inbound delivery subsystem.
//!
//! # Data Flow
//! ```text
//! reader task
//!     → fast_preprocess
//!     → can_fast_dispatch? ── yes ──▶ ms_fast_dispatch (on the reader)
//!     → no: dispatch_queue.enqueue(priority, connection)
//!            → prioritized_queue.rs (strict lane + token buckets)
//!            → dispatch task → Dispatchers chain → ms_dispatch
//!
//! socket lifecycle (connect / accept / reset / remote reset / refused)
//!     → strict lane → ms_handle_*
//!
//! self-addressed sends
//!     → local FIFO → local delivery task → fast dispatch or enqueue
//! ```
//!
//! # Design Decisions
//! - Fairness across priorities, not global FIFO, is the ordering contract
//! - Per connection, messages of one priority are delivered in order
//! - Dispatcher callbacks are synchronous and run without queue locks held

pub mod dispatch_queue;
pub mod dispatcher;
pub mod prioritized_queue;

pub use dispatch_queue::{DispatchEvent, DispatchQueue};
pub use dispatcher::{Delivery, Dispatcher, Dispatchers};
pub use prioritized_queue::PrioritizedQueue;
