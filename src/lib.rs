//! Notibus - Topic-based real-time notification broker
//!
//! Clients hold a persistent connection (plain TCP or WebSocket),
//! subscribe to opaque topic names and receive every message published
//! to those topics while connected. Delivery is best-effort and
//! at-most-once, with a bounded outbound queue per connection so a slow
//! subscriber never stalls a publisher.

pub mod broker;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerEvent, PublishReceipt};
pub use config::{Config, OverflowPolicy};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{ClientFrame, ConnectionId, ServerFrame, Topic};
pub use registry::SubscriptionRegistry;
