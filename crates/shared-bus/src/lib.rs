//! # Shared Bus - Notification Fan-Out
//!
//! The Notifier for the escrow engine: best-effort, in-process event
//! fan-out of committed audit records.
//!
//! ## Contract
//!
//! - The engine publishes strictly AFTER its local commit, never before.
//! - Publication is fire-and-forget: the engine does not consume the
//!   return value, and a bus with no subscribers is not an error.
//! - Subscribers receive committed [`shared_types::EventRecord`]s wrapped
//!   in a [`Notification`], filtered by topic and/or invoice.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │    Engine    │                    │  Subscriber  │
//! │              │    publish()       │ (webhooks,   │
//! │              │ ──────┐            │  dashboards) │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │ Notification │          │
//!                  │     Bus      │ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{EventFilter, EventTopic, Notification};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{EventStream, Subscription, SubscriptionError};

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
