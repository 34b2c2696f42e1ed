//! peili - durable HTTP fan-out proxy
//!
//! Accepts HTTP requests on one ingress endpoint and replays each one to
//! every configured endpoint group, persisting through a disk-backed
//! queue so upstream outages, crashes, and restarts never drop traffic.
//! Delivery is at-least-once; the ingress ack is fire-and-forget.
//!
//! # Architecture
//!
//! ```text
//! ingress ──► per-endpoint inbox ──► durable queue ──► workers ──► hosts
//!                     ▲                                   │
//!                     └──────── re-enqueue on failure ────┘
//! ```
//!
//! Each endpoint group gets its own pipeline with no shared state between
//! them; the Prometheus registry is the only cross-pipeline surface.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod server;
pub mod worker;

pub use config::Config;
pub use error::{PeiliError, Result};
pub use pipeline::{EndpointGroup, Pipeline};
pub use queue::{DurableQueue, QueueConfig, QueueReader, QueueWriter};
pub use record::Record;
pub use server::AppState;
