//! Shared glue for the castmux SFU
//!
//! This crate carries everything the data-plane crates need but that is not
//! data-plane logic itself:
//!
//! - **`models::id`**: opaque identifier newtypes (`TrackId`, `ParticipantId`,
//!   `SubscriberId`, `ConnectionId`)
//! - **`config`**: serde-backed configuration with file + environment loading
//! - **`logging`**: structured logging bootstrap (json / pretty)
//! - **`metrics`**: explicit Prometheus metrics context passed at construction

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;

pub use config::Config;
pub use metrics::Metrics;
pub use models::id::{ConnectionId, ParticipantId, SubscriberId, TrackId};
