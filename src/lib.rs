//! # userv-notifier
//!
//! Side-car service that republishes committed `users`-table changes from
//! PostgreSQL to a Kafka topic.
//!
//! ## Architecture
//!
//! ```text
//! Postgres trigger -> NOTIFY channel -> ChangeListener -> Notifier -> Kafka topic
//!                                                            │
//!                                                       RateLimiter
//!                                                     (bounded fan-out)
//! ```
//!
//! The storage engine emits one notification per row mutation on a named
//! channel. The [`ChangeListener`] keeps a reconnecting subscription to that
//! channel; the [`Notifier`] run loop admits each event through a
//! [`RateLimiter`] and hands it to a [`Publisher`] task, which forwards the
//! payload verbatim to Kafka with trace-propagation headers attached.
//!
//! ## Modules
//!
//! - [`event`]: change-event and outbound-message types
//! - [`listener`]: reconnecting Postgres LISTEN/NOTIFY subscription
//! - [`limiter`]: counting-permit concurrency cap for publishes
//! - [`publisher`]: Kafka producer with batching and trace headers
//! - [`notifier`]: the dispatch loop coordinating all of the above
//! - [`shutdown`]: graceful-shutdown signal carrying a cause
//! - [`config`]: TOML configuration with environment substitution
//! - [`telemetry`]: tracing/OpenTelemetry setup and header injection

pub mod config;
pub mod event;
pub mod limiter;
pub mod listener;
pub mod notifier;
pub mod publisher;
pub mod shutdown;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use config::NotifierConfig;
pub use event::{ChangeEvent, OutboundMessage};
pub use limiter::RateLimiter;
pub use listener::{ChangeListener, ChangeSource};
pub use notifier::Notifier;
pub use publisher::{KafkaPublisher, Publisher};
pub use shutdown::{Shutdown, ShutdownReason};

/// Notification channel the storage trigger publishes user changes on.
pub const DEFAULT_CHANNEL: &str = "user_changes";

/// Kafka topic change events are republished to.
pub const DEFAULT_TOPIC: &str = "postgres.public.users";

/// Message key used when no key field is configured.
pub const DEFAULT_MESSAGE_KEY: &str = "user-event";
