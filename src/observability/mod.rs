//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Sockets, dispatch queue, throttles produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by EnvFilter)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Library code only emits; the binary decides whether to install a
//!   subscriber and an exporter
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
