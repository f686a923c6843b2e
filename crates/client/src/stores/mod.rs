//! Client-side state derived from inbound messages.

pub mod notifications;

pub use notifications::NotificationAggregator;
