//! Observability surface.
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────────┐  recv   ┌──────────────┐
//! │    Engine    │────────▶│  EventSink   │────────▶│  Dashboards  │
//! │ (publisher)  │         │ (host-wired) │         │ log shippers │
//! └──────────────┘         └──────────────┘         └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, EventSink, Fanout, NullSink, SharedEventSink};
pub use types::{CascadeEvent, EvictReason};
